use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::Path;

pub const CHUNK_SIZE: usize = 8192;

pub type Digest32 = [u8; 32];

/// SHA-256 of everything `reader` yields, read in 8 KiB chunks.
pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<Digest32> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}

pub fn sha256_file(path: impl AsRef<Path>) -> io::Result<Digest32> {
    sha256_reader(File::open(path)?)
}

pub fn sha256_bytes(bytes: &[u8]) -> Digest32 {
    Sha256::digest(bytes).into()
}

/// Parses a 64-character hex digest.
pub fn parse_digest(hex_digest: &str) -> Option<Digest32> {
    let raw = hex::decode(hex_digest.trim()).ok()?;
    raw.try_into().ok()
}
