//! Chunk codec: split content into fixed-size chunks, merge them back, digest

use modelplane_core::{ModelPlaneError, ModelPlaneResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Split content into ordered chunks of `chunk_size` bytes; the last one may be short
pub fn split(content: &[u8], chunk_size: usize) -> ModelPlaneResult<Vec<Vec<u8>>> {
    if chunk_size == 0 {
        return Err(ModelPlaneError::validation("chunk size must be positive"));
    }
    Ok(content.chunks(chunk_size).map(<[u8]>::to_vec).collect())
}

/// Reassemble `total_chunks` chunks given as `(chunk_number, bytes)` in any order.
///
/// A missing chunk number fails with `ResourceNotFound`.
pub fn merge(total_chunks: u32, chunks: Vec<(u32, Vec<u8>)>) -> ModelPlaneResult<Vec<u8>> {
    let mut by_number: BTreeMap<u32, Vec<u8>> = chunks.into_iter().collect();
    let capacity = by_number.values().map(Vec::len).sum();
    let mut content = Vec::with_capacity(capacity);

    for number in 0..total_chunks {
        let bytes = by_number.remove(&number).ok_or_else(|| {
            ModelPlaneError::not_found(format!("model chunk {} of {}", number, total_chunks))
        })?;
        content.extend_from_slice(&bytes);
    }

    Ok(content)
}

/// Hex-encoded SHA-256 of the content
pub fn digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_last_chunk_short() {
        let content: Vec<u8> = (0..25u8).collect();
        let chunks = split(&content, 10).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn test_split_zero_size() {
        assert!(split(b"abc", 0).is_err());
    }

    #[test]
    fn test_merge_inverts_split() {
        let content: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        for chunk_size in [1, 3, 64, 999, 1000, 4096] {
            let chunks = split(&content, chunk_size).unwrap();
            let numbered = chunks
                .into_iter()
                .enumerate()
                .map(|(i, c)| (i as u32, c))
                .collect::<Vec<_>>();
            let total = numbered.len() as u32;
            assert_eq!(merge(total, numbered).unwrap(), content);
        }
    }

    #[test]
    fn test_merge_out_of_order() {
        let chunks = vec![(2, b"c".to_vec()), (0, b"a".to_vec()), (1, b"b".to_vec())];
        assert_eq!(merge(3, chunks).unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_merge_missing_chunk() {
        let chunks = vec![(0, b"a".to_vec()), (2, b"c".to_vec())];
        let err = merge(3, chunks).unwrap_err();
        assert!(matches!(err, ModelPlaneError::ResourceNotFound(_)));
    }

    #[test]
    fn test_empty_content() {
        let chunks = split(&[], 8).unwrap();
        assert!(chunks.is_empty());
        assert!(merge(0, Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_digest_known_value() {
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(digest(b"abc"), digest(b"abd"));
    }
}
