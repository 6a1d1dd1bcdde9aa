use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

pub const END_OF_MESSAGE: u8 = b'\n';
pub const SEPARATOR: u8 = b' ';

/// Splits at the first separator. `FIND 7` yields `("FIND", Some("7"))`;
/// `QUIT` yields `("QUIT", None)`; `FIND ` yields `("FIND", Some(""))`.
pub fn split_on_separator(data: &Bytes) -> (Bytes, Option<Bytes>) {
    match data.iter().position(|&b| b == SEPARATOR) {
        Some(idx) => (data.slice(..idx), Some(data.slice(idx + 1..))),
        None => (data.clone(), None),
    }
}

/// Builds `TOKEN[ part]*\n`.
pub fn encode_frame(token: &[u8], parts: &[&[u8]]) -> Bytes {
    let len = token.len() + parts.iter().map(|p| p.len() + 1).sum::<usize>() + 1;
    let mut buf = BytesMut::with_capacity(len);
    buf.put_slice(token);
    for part in parts {
        buf.put_u8(SEPARATOR);
        buf.put_slice(part);
    }
    buf.put_u8(END_OF_MESSAGE);
    buf.freeze()
}

/// Newline framing for `FramedRead` / `FramedWrite`.
///
/// Decoding yields complete frames without their terminator. Encoding writes
/// the bytes as given, since [`encode_frame`] already terminated them.
#[derive(Debug, Default)]
pub struct FrameCodec {
    // Bytes already scanned for a terminator.
    next_index: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        let Some(offset) = src[self.next_index..]
            .iter()
            .position(|&b| b == END_OF_MESSAGE)
        else {
            self.next_index = src.len();
            return Ok(None);
        };

        let idx = self.next_index + offset;
        self.next_index = 0;
        let mut frame = src.split_to(idx + 1);
        frame.truncate(idx);
        Ok(Some(frame.freeze()))
    }

    /// Leaves an unterminated tail in the buffer so the reader can report it.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        self.decode(src)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
