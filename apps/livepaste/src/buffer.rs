use bytes::Bytes;
use std::fmt;

/// Immutable snapshot of the text being shared.
///
/// A session re-uploads the snapshot it was started with on every round;
/// edits made to the source text afterwards never reach an active session.
/// Cloning only bumps a reference count.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer {
    body: Bytes,
}

impl Buffer {
    pub fn capture(text: &str) -> Self {
        Self {
            body: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    /// Length of the UTF-8 encoding, which is what the server pre-allocates.
    pub fn byte_len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn body(&self) -> Bytes {
        self.body.clone()
    }
}

impl From<String> for Buffer {
    fn from(text: String) -> Self {
        Self {
            body: Bytes::from(text.into_bytes()),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("bytes", &self.body.len())
            .finish()
    }
}
