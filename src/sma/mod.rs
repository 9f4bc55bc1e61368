//! SMA Bluetooth protocol: framing codec, link reader, stream reassembly and
//! the script driven exchange that ties them together.

pub mod codes;
pub mod escape;
pub mod fcs;
pub mod length;
pub mod reader;
pub mod records;
pub mod retry;
pub mod script;
pub mod session;
pub mod stream;
pub mod transport;
pub mod units;

/// Frame delimiter; a raw body ending in this byte terminates a message.
pub const FRAME_MARKER: u8 = 0x7e;
pub const ESCAPE: u8 = 0x7d;
pub const HEADER_LEN: usize = 3;

/// Start of the checksummed part of an outgoing frame. Nothing before it is
/// ever escaped.
pub const PAYLOAD_OFFSET: usize = 19;
