use std::io::{self, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

// Formats that are already compressed or packed; gzip only wastes CPU on them.
const SKIP_EXTENSIONS: &[&str] = &[
    // images
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "avif", "jxl",
    // video
    "mp4", "mkv", "mov", "avi", "webm", "m4v", "wmv", "flv",
    // audio
    "mp3", "aac", "ogg", "opus", "flac", "m4a", "wma",
    // archives
    "zip", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar", "lz4", "br",
    // packed documents
    "pdf", "docx", "xlsx", "pptx", "odt", "ods", "odp", "epub", "jar", "apk",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub data: Vec<u8>,
    pub compressed: bool,
}

pub fn should_compress(name: &str) -> bool {
    let ext = Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match ext {
        Some(ext) => !SKIP_EXTENSIONS.contains(&ext.as_str()),
        None => true,
    }
}

/// Gzips `data` unless the name marks it as pre-compressed. The gzip output is
/// kept only when strictly smaller than the input.
pub fn compress(data: Vec<u8>, name: &str) -> io::Result<Compressed> {
    if data.is_empty() || !should_compress(name) {
        return Ok(Compressed {
            data,
            compressed: false,
        });
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(&data)?;
    let packed = encoder.finish()?;
    if packed.len() < data.len() {
        Ok(Compressed {
            data: packed,
            compressed: true,
        })
    } else {
        Ok(Compressed {
            data,
            compressed: false,
        })
    }
}

/// `compressed` comes from the frame header; the payload itself is never sniffed.
pub fn decompress(data: Vec<u8>, compressed: bool) -> io::Result<Vec<u8>> {
    if !compressed {
        return Ok(data);
    }
    let mut decoder = GzDecoder::new(&data[..]);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn compressible_text_is_compressed() {
        let data = "hello vault ".repeat(500).into_bytes();
        let out = compress(data.clone(), "notes.txt").unwrap();
        assert!(out.compressed);
        assert!(out.data.len() < data.len());
        assert_eq!(decompress(out.data, true).unwrap(), data);
    }

    #[test]
    fn incompressible_data_is_stored_raw() {
        let mut data = vec![0u8; 8192];
        rand::thread_rng().fill_bytes(&mut data);
        let out = compress(data.clone(), "blob.bin").unwrap();
        assert!(!out.compressed);
        assert_eq!(out.data, data);
        assert_eq!(decompress(out.data, out.compressed).unwrap(), data);
    }

    #[test]
    fn empty_input_round_trips() {
        let out = compress(Vec::new(), "empty.txt").unwrap();
        assert!(!out.compressed);
        assert!(decompress(out.data, out.compressed).unwrap().is_empty());
    }

    #[test]
    fn packed_formats_are_skipped() {
        let data = "aaaa".repeat(1000).into_bytes();
        for name in ["photo.JPG", "movie.mp4", "backup.tar.gz", "book.epub", "Report.PDF"] {
            let out = compress(data.clone(), name).unwrap();
            assert!(!out.compressed, "{name} should bypass compression");
            assert_eq!(out.data, data);
        }
        assert!(should_compress("Makefile"));
        assert!(should_compress("report.csv"));
    }

    #[test]
    fn raw_flag_never_sniffs_gzip_magic() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"payload").unwrap();
        let gz = encoder.finish().unwrap();
        assert_eq!(decompress(gz.clone(), false).unwrap(), gz);
    }
}
