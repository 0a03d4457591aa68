use sha2::{Digest, Sha256};
use std::{fs::File, io::{self, Read}, path::Path};

/// Read size per chunk; bounds memory regardless of file size.
pub const CHUNK_SIZE: usize = 4096;

/// Hex SHA-256 of the file contents. Used as a content fingerprint, not for
/// anything security-relevant.
pub fn digest(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut h = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match f.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        h.update(&buf[..n]);
    }
    Ok(format!("{:x}", h.finalize()))
}
