use crate::prelude::*;

use bytes::{BufMut, Bytes, BytesMut};

use super::reader::{Frame, LinkReader};
use super::records::nullable_le;
use super::transport::Transport;
use crate::error::LinkError;

/// Little endian count of records still to come, in the first frame.
pub const RECORD_COUNT_OFFSET: usize = 43;
pub const FIRST_PAYLOAD_OFFSET: usize = 59;
pub const CONTINUATION_PAYLOAD_OFFSET: usize = 18;

/// Checksum and marker at the end of a terminated frame.
const TRAILER_LEN: usize = 3;
const MAX_PAYLOAD_END: usize = 501;
pub const MAX_FRAMES: usize = 64;

/// A data record reassembled from one or more frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    pub data: Bytes,
    /// Records the inverter still has queued after this stream.
    pub togo: u16,
    pub frames: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct Reassembler {
    reader: LinkReader,
}

impl Reassembler {
    pub fn new(reader: LinkReader) -> Self {
        Self { reader }
    }

    /// Builds a stream starting from `frame`, the frame already received.
    /// Continuation frames are read until one is terminated. On return
    /// `frame` holds the last frame read.
    pub fn read<T>(&self, transport: &mut T, frame: &mut Frame, last_sent: &[u8]) -> Result<Stream, LinkError>
    where
        T: Transport + ?Sized,
    {
        if frame.len() < RECORD_COUNT_OFFSET + 2 {
            return Err(LinkError::StreamTooShort { len: frame.len() });
        }
        let togo = nullable_le(&frame.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 2]) as u16;

        let mut data = BytesMut::with_capacity(frame.len());
        let mut offset = FIRST_PAYLOAD_OFFSET;
        let mut frames = 1;

        loop {
            data.put_slice(payload(frame, offset)?);
            if frame.terminated {
                break;
            }
            if frames >= MAX_FRAMES {
                return Err(LinkError::TooManyFrames { limit: MAX_FRAMES });
            }

            *frame = self.reader.read_frame(transport, last_sent)?;
            frames += 1;
            offset = CONTINUATION_PAYLOAD_OFFSET;
        }

        debug!("stream of {} bytes from {} frame(s), togo={}", data.len(), frames, togo);
        trace!("stream {}", Utils::hex(&data));

        Ok(Stream {
            data: data.freeze(),
            togo,
            frames,
        })
    }
}

fn payload(frame: &Frame, offset: usize) -> Result<&[u8], LinkError> {
    let end = if frame.terminated {
        frame.len().saturating_sub(TRAILER_LEN)
    } else {
        frame.len()
    };

    if end > MAX_PAYLOAD_END {
        return Err(LinkError::PayloadOverrun { offset: end });
    }
    if offset >= end {
        return Ok(&[]);
    }

    Ok(&frame.data[offset..end])
}
