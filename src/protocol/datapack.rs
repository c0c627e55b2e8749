//! Frame packing and unpacking.
//!
//! `DataPack` is stateless apart from the configured maximum body size and
//! performs no I/O except in [`DataPack::read_message`], which drives the
//! two-step header/body decode over any async reader.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::Message;
use crate::error::{Error, Result};

/// Size of the fixed frame header: body length (u32) + message id (u32).
pub const HEAD_LEN: usize = 8;

/// A decoded frame header: a message shell whose body has not been read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Declared body length.
    pub data_len: u32,
    /// Application message id.
    pub msg_id: u32,
}

impl FrameHeader {
    /// Attach the body read for this header.
    ///
    /// The caller must have read exactly `data_len` bytes.
    pub fn with_body(self, body: Bytes) -> Result<Message> {
        if body.len() != self.data_len as usize {
            return Err(Error::BodyLengthMismatch {
                declared: self.data_len,
                actual: body.len(),
            });
        }
        Ok(Message::new(self.msg_id, body))
    }
}

/// Codec between [`Message`] and its wire frame.
#[derive(Debug, Clone, Copy)]
pub struct DataPack {
    /// Largest accepted body. Always enforced; 0 admits only empty bodies.
    max_package_size: u32,
}

impl DataPack {
    /// Create a codec enforcing `max_package_size` on decode.
    pub fn new(max_package_size: u32) -> Self {
        Self { max_package_size }
    }

    /// Length of the fixed header in bytes.
    pub fn head_len(&self) -> usize {
        HEAD_LEN
    }

    pub fn max_package_size(&self) -> u32 {
        self.max_package_size
    }

    /// Serialize a message as `length | id | body`, big-endian.
    pub fn pack(&self, msg: &Message) -> Result<Bytes> {
        let data_len = u32::try_from(msg.len()).map_err(|_| Error::PackageTooLarge {
            size: msg.len() as u64,
            max: u32::MAX as u64,
        })?;

        let mut dst = BytesMut::with_capacity(HEAD_LEN + msg.len());
        dst.put_u32(data_len);
        dst.put_u32(msg.id());
        dst.put_slice(msg.data());

        Ok(dst.freeze())
    }

    /// Decode a header from exactly [`HEAD_LEN`] bytes.
    ///
    /// Rejects a declared length above the configured maximum so the body
    /// is never allocated.
    pub fn unpack_header(&self, mut head: &[u8]) -> Result<FrameHeader> {
        if head.len() != HEAD_LEN {
            return Err(Error::MalformedHeader {
                expected: HEAD_LEN,
                actual: head.len(),
            });
        }

        let data_len = head.get_u32();
        let msg_id = head.get_u32();

        if data_len > self.max_package_size {
            return Err(Error::PackageTooLarge {
                size: data_len as u64,
                max: self.max_package_size as u64,
            });
        }

        Ok(FrameHeader { data_len, msg_id })
    }

    /// Read one complete frame from `reader`.
    ///
    /// A short read or EOF at any point surfaces as [`Error::Io`].
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; HEAD_LEN];
        reader.read_exact(&mut head).await?;

        let header = self.unpack_header(&head)?;

        let mut body = BytesMut::zeroed(header.data_len as usize);
        if header.data_len > 0 {
            reader.read_exact(&mut body).await?;
        }

        header.with_body(body.freeze())
    }
}
