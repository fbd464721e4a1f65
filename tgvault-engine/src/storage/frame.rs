use thiserror::Error;

pub const FRAME_MAGIC: &[u8; 4] = b"TGVF";
pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 42;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const NAME_OFFSET: usize = 22;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is truncated: {0} bytes, header needs {HEADER_LEN}")]
    Truncated(usize),
    #[error("frame magic mismatch")]
    BadMagic,
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("frame name length {0} exceeds {MAX_NAME_LEN}")]
    NameTooLong(usize),
}

/// Header written in front of every transmitted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub compressed: bool,
    pub original_size: u64,
    pub chunk_index: u16,
    pub chunk_total: u16,
    pub name: String,
}

impl FrameHeader {
    pub fn new(
        name: &str,
        original_size: u64,
        compressed: bool,
        chunk_index: u16,
        chunk_total: u16,
    ) -> Self {
        Self {
            compressed,
            original_size,
            chunk_index,
            chunk_total,
            name: truncate_name(name).to_string(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(FRAME_MAGIC);
        out[4] = FRAME_VERSION;
        out[5] = if self.compressed { FLAG_COMPRESSED } else { 0 };
        // 6..8 reserved
        out[8..16].copy_from_slice(&self.original_size.to_be_bytes());
        out[16..18].copy_from_slice(&self.chunk_index.to_be_bytes());
        out[18..20].copy_from_slice(&self.chunk_total.to_be_bytes());
        let name = truncate_name(&self.name).as_bytes();
        out[20..22].copy_from_slice(&(name.len() as u16).to_be_bytes());
        out[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Truncated(data.len()));
        }
        if &data[..4] != FRAME_MAGIC {
            return Err(FrameError::BadMagic);
        }
        if data[4] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(data[4]));
        }
        let name_len = u16::from_be_bytes([data[20], data[21]]) as usize;
        if name_len > MAX_NAME_LEN {
            return Err(FrameError::NameTooLong(name_len));
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&data[8..16]);
        Ok(Self {
            compressed: data[5] & FLAG_COMPRESSED != 0,
            original_size: u64::from_be_bytes(size),
            chunk_index: u16::from_be_bytes([data[16], data[17]]),
            chunk_total: u16::from_be_bytes([data[18], data[19]]),
            name: String::from_utf8_lossy(&data[NAME_OFFSET..NAME_OFFSET + name_len]).into_owned(),
        })
    }
}

/// Header followed by the payload, nothing trailing.
pub fn frame(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

pub fn unframe(data: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header = FrameHeader::parse(data)?;
    Ok((header, &data[HEADER_LEN..]))
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
