use crate::prelude::*;

use std::io;

use super::length::{self, Repair};
use super::transport::{self, Transport};
use super::{escape, FRAME_MARKER, HEADER_LEN};
use crate::error::LinkError;

/// One frame as the exchange sees it: the three raw header bytes followed by
/// the unescaped body, with the length field repaired.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    /// The raw body ended in the frame marker, so no continuation follows.
    pub terminated: bool,
}

impl Frame {
    pub fn new(data: Vec<u8>, terminated: bool) -> Self {
        Self { data, terminated }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reads single frames off a transport.
#[derive(Clone, Copy, Debug)]
pub struct LinkReader {
    timeout: Duration,
}

impl LinkReader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reads the next frame. `last_sent` is the frame most recently written;
    /// getting it straight back means the link is echoing rather than talking
    /// to the inverter.
    pub fn read_frame<T>(&self, transport: &mut T, last_sent: &[u8]) -> Result<Frame, LinkError>
    where
        T: Transport + ?Sized,
    {
        let mut header = [0u8; HEADER_LEN];
        match self.fill(transport, &mut header)? {
            0 => return Err(LinkError::Timeout(self.timeout)),
            HEADER_LEN => {}
            got => {
                return Err(LinkError::ShortRead {
                    expected: HEADER_LEN,
                    got,
                })
            }
        }

        let declared = header[1];
        if (declared as usize) < HEADER_LEN {
            return Err(LinkError::BadLength(declared));
        }

        let mut body = vec![0u8; declared as usize - HEADER_LEN];
        let got = self.fill(transport, &mut body)?;
        if got < body.len() {
            return Err(LinkError::ShortRead {
                expected: body.len(),
                got,
            });
        }

        trace!("received raw {} {}", Utils::hex(&header), Utils::hex(&body));

        if last_sent.len() == HEADER_LEN + body.len()
            && last_sent[..HEADER_LEN] == header
            && last_sent[HEADER_LEN..] == body[..]
        {
            return Err(LinkError::Echo);
        }

        let terminated = body.last() == Some(&FRAME_MARKER);

        let mut data = Vec::with_capacity(declared as usize);
        data.extend_from_slice(&header);
        escape::unescape_into(&body, &mut data)?;

        if data.len() > HEADER_LEN {
            if let Repair::Repaired { length, companion } = length::repair_received(&mut data)? {
                trace!(
                    "repaired length 0x{:02x} -> 0x{:02x}, companion 0x{:02x}",
                    declared,
                    length,
                    companion
                );
            }
        }

        debug!("frame of {} bytes, terminated={}", data.len(), terminated);

        Ok(Frame::new(data, terminated))
    }

    /// Reads until `buf` is full or a read times out; returns the byte count.
    fn fill<T>(&self, transport: &mut T, buf: &mut [u8]) -> Result<usize, LinkError>
    where
        T: Transport + ?Sized,
    {
        let mut got = 0;
        while got < buf.len() {
            match transport.read_timeout(&mut buf[got..], self.timeout) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => got += n,
                Err(e) if transport::is_timeout(&e) => break,
                Err(e) => return Err(from_io(e)),
            }
        }
        Ok(got)
    }
}

fn from_io(err: io::Error) -> LinkError {
    use io::ErrorKind::*;

    match err.kind() {
        UnexpectedEof | BrokenPipe | ConnectionReset | ConnectionAborted => LinkError::Closed,
        _ => LinkError::Io(err),
    }
}
