pub mod cipher;
pub mod compress;
pub mod frame;

pub use cipher::{Cipher, CipherError};
pub use compress::{Compressed, compress, decompress};
pub use frame::{FrameError, FrameHeader, HEADER_LEN};
