//! Recorded and composed containers.

use std::sync::Arc;

/// Append-only, arrival-ordered sequence of encoded chunks.
///
/// Zero-length chunks are ignored; every other chunk is retained as-is.
#[derive(Debug, Clone, Default)]
pub struct ChunkSequence {
    chunks: Vec<Arc<[u8]>>,
    total_bytes: usize,
}

impl ChunkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Returns `false` when the chunk was empty and ignored.
    pub fn push(&mut self, chunk: impl Into<Arc<[u8]>>) -> bool {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return false;
        }
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
        true
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(|c| c.as_ref())
    }

    /// Concatenate all chunks in arrival order.
    pub fn into_container(self, mime_type: impl Into<String>) -> RawContainer {
        let mut bytes = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            bytes.extend_from_slice(chunk);
        }
        RawContainer::new(bytes, mime_type)
    }
}

/// The recorder's finished output: immutable bytes plus declared mime type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContainer {
    bytes: Arc<[u8]>,
    mime_type: String,
}

impl RawContainer {
    pub fn new(bytes: impl Into<Arc<[u8]>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }
}

/// Terminal artifact handed to the caller: composed output, or the raw
/// recording when composition was skipped or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalContainer {
    bytes: Arc<[u8]>,
    mime_type: String,
    composed: bool,
}

impl FinalContainer {
    /// A freshly composed container.
    pub fn composed(bytes: impl Into<Arc<[u8]>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
            composed: true,
        }
    }

    /// The raw recording, untouched.
    pub fn passthrough(raw: &RawContainer) -> Self {
        Self {
            bytes: raw.shared_bytes(),
            mime_type: raw.mime_type.clone(),
            composed: false,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Whether the bytes went through composition.
    pub fn is_composed(&self) -> bool {
        self.composed
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_chunks_are_ignored() {
        let mut seq = ChunkSequence::new();
        assert!(seq.push(vec![1u8, 2]));
        assert!(!seq.push(Vec::<u8>::new()));
        assert!(seq.push(vec![3u8]));
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.total_bytes(), 3);
        assert_eq!(seq.into_container("video/webm").bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_passthrough_shares_raw_bytes() {
        let raw = RawContainer::new(vec![9u8; 16], "video/webm;codecs=vp9");
        let out = FinalContainer::passthrough(&raw);
        assert_eq!(out.bytes(), raw.bytes());
        assert_eq!(out.mime_type(), raw.mime_type());
        assert!(!out.is_composed());
    }

    proptest! {
        #[test]
        fn prop_container_is_ordered_concatenation(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..32)
        ) {
            let mut seq = ChunkSequence::new();
            for chunk in &chunks {
                seq.push(chunk.clone());
            }
            let expected: Vec<u8> = chunks.concat();
            let container = seq.into_container("video/mp4");
            prop_assert_eq!(container.bytes(), expected.as_slice());
        }
    }
}
