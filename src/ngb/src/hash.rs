//! Content hash of the decoded stream buffers

use sha2::{Digest, Sha256};

use crate::metadata::MetadataValue;

/// Method name stored next to the digest
pub const HASH_METHOD: &str = "SHA-256";

/// SHA-256 over the given buffers in order, hex encoded.
///
/// This is not the BLAKE2b file digest other NGB readers report, so the two
/// never compare equal. The input is the stream buffers rather than the
/// package file, which the decoder never sees; for the same reason the stored
/// object has no `file` entry.
pub fn content_hash<'a>(buffers: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for buffer in buffers {
        hasher.update(buffer);
    }
    hex::encode(hasher.finalize())
}

/// `{method, hash}` object stored under `file_hash`
pub(crate) fn file_hash_value(hash: String) -> MetadataValue {
    MetadataValue::Object(
        [
            ("method".to_string(), MetadataValue::from(HASH_METHOD)),
            ("hash".to_string(), MetadataValue::String(hash)),
        ]
        .into_iter()
        .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            content_hash([&b"abc"[..]]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_buffers_are_concatenated() {
        assert_eq!(
            content_hash([&b"ab"[..], b"c"]),
            content_hash([&b"abc"[..]])
        );
        assert_ne!(content_hash([&b"abc"[..]]), content_hash([&b"abd"[..]]));
    }

    #[test]
    fn test_file_hash_value() {
        let value = file_hash_value("00".into());
        let object = value.as_object().unwrap();
        assert_eq!(object["method"].as_str(), Some("SHA-256"));
        assert_eq!(object["hash"].as_str(), Some("00"));
        assert_eq!(object.len(), 2);
    }
}
