//! Newline-framed duplex transport over a byte stream.
//!
//! A frame is `<TOKEN>[ <DATA>]\n`. The reader side hands each frame (without
//! its terminator) to a handler in wire order; the writer side drains an
//! unbounded queue so producers never block.

pub mod error;
pub mod frame;
pub mod framed;

pub use error::TransportError;
pub use frame::{encode_frame, split_on_separator, FrameCodec, END_OF_MESSAGE, SEPARATOR};
pub use framed::{FrameHandler, FrameSender, FramedTransport};
