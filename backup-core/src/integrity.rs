//! Content checksums for file- and manifest-level integrity.
//!
//! All digests are lower-case hex SHA-256. Streaming functions read through an
//! 8 KiB buffer, so memory use does not depend on input size.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const BUFFER_SIZE: usize = 8192;

/// Compute the checksum of everything readable from `reader`.
///
/// A read error aborts the computation; a partial digest is never returned.
pub fn checksum<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn checksum_text(text: &str) -> String {
    checksum_bytes(text.as_bytes())
}

pub fn checksum_file(path: &Path) -> io::Result<String> {
    checksum(File::open(path)?)
}

/// Stream `reader` and compare its digest with `expected` (case-insensitive).
pub fn verify<R: Read>(reader: R, expected: &str) -> io::Result<bool> {
    Ok(checksum(reader)?.eq_ignore_ascii_case(expected))
}

/// `Read` adapter hashing every byte that passes through it.
///
/// Lets the pipeline checksum a file while it is being compressed, in one pass.
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Consume the adapter, returning the hex digest and byte count.
    pub fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes_read)
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::Other, "device went away"));
            }
            self.served = true;
            buf[..4].copy_from_slice(b"abcd");
            Ok(4)
        }
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(checksum_bytes(b""), EMPTY_SHA256);
        assert_eq!(
            checksum_text("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_streaming_matches_buffer() -> io::Result<()> {
        let data = vec![7u8; BUFFER_SIZE * 3 + 17];
        assert_eq!(checksum(Cursor::new(&data))?, checksum_bytes(&data));
        Ok(())
    }

    #[test]
    fn test_read_error_is_not_a_digest() {
        let result = checksum(FailingReader { served: false });
        assert!(result.is_err());
    }

    #[test]
    fn test_verify() -> io::Result<()> {
        let digest = checksum_bytes(b"payload");
        assert!(verify(Cursor::new(b"payload"), &digest)?);
        assert!(verify(Cursor::new(b"payload"), &digest.to_uppercase())?);
        assert!(!verify(Cursor::new(b"tampered"), &digest)?);
        Ok(())
    }

    #[test]
    fn test_checksum_reader_passthrough() -> io::Result<()> {
        let mut reader = ChecksumReader::new(Cursor::new(b"hello world".to_vec()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        assert_eq!(out, b"hello world");
        assert_eq!(reader.bytes_read(), 11);
        let (digest, len) = reader.finish();
        assert_eq!(digest, checksum_bytes(b"hello world"));
        assert_eq!(len, 11);
        Ok(())
    }
}
