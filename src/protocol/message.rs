//! Decoded protocol message.

use bytes::Bytes;

/// One protocol unit: an application message id and its payload.
///
/// The length carried on the wire is always derived from `data`, so a
/// `Message` can never disagree with its own body size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    data: Bytes,
}

impl Message {
    /// Create a message from an id and a payload.
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Application message type, used to select a router.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume the message, returning the payload.
    pub fn into_data(self) -> Bytes {
        self.data
    }
}
