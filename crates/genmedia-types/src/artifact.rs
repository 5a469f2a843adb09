use bytes::Bytes;

use crate::mime;

/// The binary output produced for one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl Artifact {
    pub fn new(bytes: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Storage extension implied by the MIME type.
    pub fn extension(&self) -> &'static str {
        mime::extension_for(&self.mime_type)
    }
}
