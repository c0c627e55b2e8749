//! Wire protocol for framewire.
//!
//! Every message travels as one frame: a fixed 8-byte header followed by
//! the body.
//!
//! ```text
//! +----------------+----------------+------------------+
//! | Length (4B BE) | Msg ID (4B BE) | Body (Length B)  |
//! +----------------+----------------+------------------+
//! ```
//!
//! Decoding is split in two steps so the reader can check the declared
//! length against the configured maximum before it allocates or reads the
//! body.

mod datapack;
mod message;

pub use datapack::{DataPack, FrameHeader, HEAD_LEN};
pub use message::Message;
