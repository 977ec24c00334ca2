use std::io::{self, Write};

use sha2::{Digest as _, Sha256};

const ALGORITHM: &str = "sha256";

/// Computes the `sha256:<hex>` digest of a byte slice.
pub fn from_bytes(bytes: &[u8]) -> String {
    let mut digest = Sha256::new();
    digest.update(bytes);
    format_digest(digest)
}

/// Writer wrapper that hashes every byte passed through to the inner writer.
pub struct HashingWriter<W> {
    inner: W,
    digest: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digest: Sha256::new(),
        }
    }

    pub fn finish(self) -> (W, String) {
        let hash = format_digest(self.digest);
        (self.inner, hash)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.digest.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn format_digest(digest: Sha256) -> String {
    format!("{ALGORITHM}:{}", hex_encode(&digest.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::{HashingWriter, from_bytes};

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_input_hashes_to_well_known_digest() {
        assert_eq!(from_bytes(b""), EMPTY_SHA256);
    }

    #[test]
    fn digest_is_prefixed_and_lowercase_hex() {
        let hash = from_bytes(b"sample blob");
        assert!(hash.starts_with("sha256:"), "hash: {hash}");
        assert_eq!(hash.len(), "sha256:".len() + 64);
        assert!(
            hash["sha256:".len()..]
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
    }

    #[test]
    fn hashing_writer_matches_from_bytes() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"split ").unwrap();
        writer.write_all(b"input").unwrap();
        let (buf, hash) = writer.finish();
        assert_eq!(buf, b"split input");
        assert_eq!(hash, from_bytes(b"split input"));
    }
}
