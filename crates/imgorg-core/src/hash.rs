use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const READ_CHUNK: usize = 64 * 1024;

/// SHA-256 digest of a file's full content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell entries apart in logs
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// Hash the whole file. Returns an error if the file cannot be opened or
/// read, or if fewer/more bytes than `expected_len` were read (the file
/// changed under us).
pub fn hash_file(path: &Path, expected_len: Option<u64>) -> io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total: u64 = 0;

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    if let Some(expected) = expected_len {
        if total != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{}: read {} bytes, expected {}",
                    path.display(),
                    total,
                    expected
                ),
            ));
        }
    }

    Ok(Fingerprint(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_same_bytes_same_fingerprint() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("nested-b.png");
        std::fs::write(&a, b"identical bytes").unwrap();
        std::fs::write(&b, b"identical bytes").unwrap();

        let fa = hash_file(&a, Some(15)).unwrap();
        let fb = hash_file(&b, None).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(fa, Fingerprint::of_bytes(b"identical bytes"));
    }

    #[test]
    fn test_large_file_hashed_in_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.raw");
        let mut data = vec![0x11u8; READ_CHUNK * 3 + 17];
        std::fs::write(&path, &data).unwrap();
        let before = hash_file(&path, None).unwrap();

        // A change in the last chunk must change the digest
        *data.last_mut().unwrap() = 0x12;
        std::fs::write(&path, &data).unwrap();
        let after = hash_file(&path, None).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_size_mismatch_is_read_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.jpg");
        std::fs::write(&path, b"1234").unwrap();
        let err = hash_file(&path, Some(10)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(hash_file(&dir.path().join("nope.jpg"), None).is_err());
    }

    #[test]
    fn test_hex_form() {
        let fp = Fingerprint::of_bytes(b"");
        assert_eq!(
            fp.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
