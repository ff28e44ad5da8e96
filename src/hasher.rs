//! Content hashing with BLAKE3

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Identifier of the digest algorithm, persisted in the store format marker
/// so readers can reject stores written with a different hash.
pub const HASH_ALGORITHM: &str = "blake3";

/// Width of a digest in bytes
pub const DIGEST_LEN: usize = 32;

/// A fixed-width content digest.
///
/// Equality is byte equality; the canonical textual form is lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Digest width in bytes.
    pub fn digest_len() -> usize {
        DIGEST_LEN
    }

    /// Lowercase hex rendering.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse a digest from its canonical hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidArgument {
            reason: format!("not a hex digest: {:?}", s),
        })?;
        let raw: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| Error::InvalidArgument {
            reason: format!("digest must be {} bytes", DIGEST_LEN),
        })?;
        Ok(Digest(raw))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash a byte buffer.
pub fn hash_bytes(data: &[u8]) -> Digest {
    Digest(*blake3::hash(data).as_bytes())
}

/// Hash everything a reader yields, streaming.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<Digest> {
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(Digest(*hasher.finalize().as_bytes()))
}

/// Hash a regular file in streaming fashion.
///
/// Missing paths fail with [`Error::FileNotFound`]; directories and other
/// non-regular paths fail with an argument error.
pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<Digest> {
    let path = path.as_ref();
    let metadata = path.symlink_metadata().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            Error::io_at(path, e)
        }
    })?;
    if !metadata.is_file() {
        return Err(Error::InvalidArgument {
            reason: format!("not a regular file: {}", path.display()),
        });
    }
    let file = File::open(path).map_err(|e| Error::io_at(path, e))?;
    hash_reader(file)
}

/// Incremental hasher over the same digest family.
///
/// `finalize` is single-shot; `reset` returns the hasher to its initial
/// state. Instances are not meant to be shared across threads.
#[derive(Debug)]
pub struct StreamingHasher {
    inner: blake3::Hasher,
    finalized: bool,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
            finalized: false,
        }
    }

    /// Feed a whole buffer.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.inner.update(data);
        Ok(())
    }

    /// Feed `len` bytes of `data` starting at `offset`.
    pub fn update_range(&mut self, data: &[u8], offset: usize, len: usize) -> Result<()> {
        self.ensure_open()?;
        let end = offset.checked_add(len).ok_or_else(|| Error::InvalidArgument {
            reason: "offset + len overflows".to_string(),
        })?;
        if end > data.len() {
            return Err(Error::InvalidArgument {
                reason: format!(
                    "range {}..{} outside buffer of {} bytes",
                    offset,
                    end,
                    data.len()
                ),
            });
        }
        self.inner.update(&data[offset..end]);
        Ok(())
    }

    /// Produce the digest. A second call fails with a state error.
    pub fn finalize(&mut self) -> Result<Digest> {
        self.ensure_open()?;
        self.finalized = true;
        Ok(Digest(*self.inner.finalize().as_bytes()))
    }

    /// Return to the initial state, ready for reuse.
    pub fn reset(&mut self) {
        self.inner.reset();
        self.finalized = false;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::State {
                reason: "hasher already finalized".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn digest_round_trips_through_hex() {
        let digest = hash_bytes(b"hello world");
        let parsed = Digest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(parsed, digest);
        assert_eq!(digest.to_hex().len(), DIGEST_LEN * 2);
    }

    #[test]
    fn known_blake3_vector() {
        // BLAKE3 of "hello world"
        let digest = hash_bytes(b"hello world");
        assert_eq!(
            digest.to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn streaming_matches_one_shot() -> Result<()> {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"hello ")?;
        hasher.update_range(b"xxworldyy", 2, 5)?;
        let streamed = hasher.finalize()?;
        assert_eq!(streamed, hash_bytes(b"hello world"));
        Ok(())
    }

    #[test]
    fn finalize_is_single_shot() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"data").unwrap();
        hasher.finalize().unwrap();
        assert!(matches!(hasher.finalize(), Err(Error::State { .. })));
        assert!(matches!(hasher.update(b"more"), Err(Error::State { .. })));

        hasher.reset();
        hasher.update(b"data").unwrap();
        assert_eq!(hasher.finalize().unwrap(), hash_bytes(b"data"));
    }

    #[test]
    fn update_range_rejects_bad_ranges() {
        let mut hasher = StreamingHasher::new();
        assert!(matches!(
            hasher.update_range(b"abc", 2, 5),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            hasher.update_range(b"abc", usize::MAX, 2),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn hash_file_streams_and_validates_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("data.bin");
        let mut file = File::create(&path)?;
        file.write_all(b"file contents")?;

        assert_eq!(hash_file(&path)?, hash_bytes(b"file contents"));

        let missing = temp_dir.path().join("missing");
        assert!(matches!(
            hash_file(&missing),
            Err(Error::FileNotFound { .. })
        ));
        assert!(matches!(
            hash_file(temp_dir.path()),
            Err(Error::InvalidArgument { .. })
        ));
        Ok(())
    }
}
