//! Length/companion byte repair.
//!
//! `buf[1]` carries the frame length and `buf[3]` a companion control byte
//! derived from it. Incoming frames declare their escaped length, so once
//! unescaped the pair has to be rewritten to match the bytes actually held.
//! Outgoing frames are fixed up from a larger table; receive only knows a
//! handful of lengths and falls back to keeping `len + companion` constant.

use crate::error::FrameError;

/// Companion values the receive side leaves untouched.
const PROTECTED: [u8; 2] = [0x13, 0x14];

const RECEIVE_TABLE: [(u8, u8); 4] = [(0x52, 0x2c), (0x5a, 0x24), (0x66, 0x1a), (0x6a, 0x14)];

const SEND_TABLE: [(u8, u8); 26] = [
    (0x3a, 0x44),
    (0x3b, 0x43),
    (0x3c, 0x42),
    (0x3d, 0x41),
    (0x3e, 0x40),
    (0x3f, 0x41),
    (0x40, 0x3e),
    (0x41, 0x3f),
    (0x42, 0x3c),
    (0x52, 0x2c),
    (0x53, 0x2b),
    (0x54, 0x2a),
    (0x55, 0x29),
    (0x56, 0x28),
    (0x57, 0x27),
    (0x58, 0x26),
    (0x59, 0x25),
    (0x5a, 0x24),
    (0x5b, 0x23),
    (0x5c, 0x22),
    (0x5d, 0x23),
    (0x5e, 0x20),
    (0x5f, 0x21),
    (0x60, 0x1e),
    (0x61, 0x1f),
    (0x62, 0x1e),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Repair {
    /// Declared length already matches.
    Unchanged,
    /// Companion byte is one the device uses for frames that must not be touched.
    Protected,
    Repaired { length: u8, companion: u8 },
}

fn lookup(table: &[(u8, u8)], length: u8) -> Option<u8> {
    table
        .iter()
        .find(|(len, _)| *len == length)
        .map(|(_, companion)| *companion)
}

/// Rewrites `buf[1]`/`buf[3]` so the declared length matches `buf.len()`.
pub fn repair_received(buf: &mut [u8]) -> Result<Repair, FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::TooShort { len: buf.len() });
    }
    let length = u8::try_from(buf.len()).map_err(|_| FrameError::TooLong { len: buf.len() })?;

    let (old_length, old_companion) = (buf[1], buf[3]);
    if old_length == length {
        return Ok(Repair::Unchanged);
    }
    if PROTECTED.contains(&old_companion) {
        return Ok(Repair::Protected);
    }

    let companion = lookup(&RECEIVE_TABLE, length)
        .unwrap_or_else(|| old_length.wrapping_add(old_companion).wrapping_sub(length));

    buf[1] = length;
    buf[3] = companion;

    Ok(Repair::Repaired { length, companion })
}

/// Stamps length and companion into an outgoing frame. `buf` holds the frame
/// up to and including its checksum; the terminating marker appended after
/// it is counted in the declared length.
pub fn fix_send(buf: &mut [u8]) -> Result<(), FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::TooShort { len: buf.len() });
    }

    let length = u8::try_from(buf.len() + 1).map_err(|_| FrameError::TooLong { len: buf.len() + 1 })?;
    let companion = lookup(&SEND_TABLE, length).ok_or(FrameError::UnknownSendLength { len: length })?;

    buf[1] = length;
    buf[3] = companion;

    Ok(())
}
