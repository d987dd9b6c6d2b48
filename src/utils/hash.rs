use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// File sink that hashes every byte in the same pass that writes it. The
/// archive pipeline tees through this so the checksum never needs a second
/// read of the finished archive.
pub struct HashingFile {
    file: File,
    hasher: Sha256,
    written: u64,
}

impl HashingFile {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            file,
            hasher: Sha256::new(),
            written: 0,
        })
    }

    /// Flush, fsync, and return `(sha256-hex, bytes written)`.
    pub fn finalize(mut self) -> Result<(String, u64)> {
        self.file.flush().context("flush archive sink")?;
        self.file.sync_all().context("fsync archive sink")?;
        let digest = self.hasher.finalize();
        Ok((hex_lower(&digest), self.written))
    }
}

impl Write for HashingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// SHA-256 of a file's content, streamed.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    hash_reader(file)
}

pub fn hash_reader<R: Read>(mut r: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf).context("read for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_lower(&hasher.finalize()))
}

pub fn hash_bytes(data: &[u8]) -> String {
    hex_lower(&Sha256::digest(data))
}

fn hex_lower(digest: &[u8]) -> String {
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write as _;
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256 of the empty string
    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_input_has_known_digest() {
        assert_eq!(hash_bytes(b""), EMPTY);
        assert_eq!(hash_reader(std::io::empty()).unwrap(), EMPTY);
    }

    #[test]
    fn sink_digest_matches_rereading_the_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("archive.bin");

        let mut sink = HashingFile::create(&path).unwrap();
        sink.write_all(b"streamed ").unwrap();
        sink.write_all(b"in two writes").unwrap();
        let (hex, bytes) = sink.finalize().unwrap();

        assert_eq!(bytes, 22);
        assert_eq!(hex, hash_file(&path).unwrap());
        assert_eq!(hex, hash_bytes(b"streamed in two writes"));
    }

    #[test]
    fn hashing_is_idempotent_and_tamper_evident() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        std::fs::write(&path, b"payload").unwrap();

        let a = hash_file(&path).unwrap();
        let b = hash_file(&path).unwrap();
        assert_eq!(a, b);

        std::fs::write(&path, b"paYload").unwrap();
        assert_ne!(a, hash_file(&path).unwrap());
    }
}
