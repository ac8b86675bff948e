use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::debug;

/// Newline-delimited syslog frames over a byte stream.
///
/// Frames are raw bytes; decoding (and lossy UTF-8 conversion) is left to
/// [`super::parse_message`], so a malformed line never ends the stream. A
/// frame longer than `max_length` is discarded up to its newline.
#[derive(Debug, Clone)]
pub struct LineFrames {
    max_length: usize,
    /// Bytes already searched for a newline
    next_index: usize,
    /// Inside an over-long frame, skipping until its newline
    discarding: bool,
}

impl LineFrames {
    pub fn new(max_length: usize) -> Self {
        Self { max_length, next_index: 0, discarding: false }
    }
}

impl Decoder for LineFrames {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf
                .get(self.next_index..read_to)
                .and_then(|window| window.iter().position(|b| *b == b'\n'))
                .map(|offset| offset + self.next_index);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    buf.advance(end + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(end)) => {
                    self.next_index = 0;
                    let mut frame = buf.split_to(end + 1);
                    frame.truncate(end);
                    return Ok(Some(frame));
                }
                (false, None) if buf.len() > self.max_length => {
                    debug!(max_length = self.max_length, "oversized syslog frame discarded");
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if self.discarding || buf.is_empty() {
            buf.clear();
            return Ok(None);
        }
        self.next_index = 0;
        Ok(Some(buf.split()))
    }
}
