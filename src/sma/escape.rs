use super::ESCAPE;
use crate::error::FrameError;

/// Bytes that may not appear literally in the escaped part of a frame.
const RESERVED: [u8; 5] = [0x7d, 0x7e, 0x11, 0x12, 0x13];

pub fn needs_escape(byte: u8) -> bool {
    RESERVED.contains(&byte)
}

/// Unescapes `raw` onto the end of `out`. An escape byte with nothing after
/// it is an error rather than a read past the body.
pub fn unescape_into(raw: &[u8], out: &mut Vec<u8>) -> Result<(), FrameError> {
    out.reserve(raw.len());

    let mut bytes = raw.iter().enumerate();
    while let Some((offset, &byte)) = bytes.next() {
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }

        match bytes.next() {
            Some((_, &next)) => out.push(match next {
                0x5e => 0x7e,
                0x5d => 0x7d,
                other => other ^ 0x20,
            }),
            None => return Err(FrameError::TruncatedEscape { offset }),
        }
    }

    Ok(())
}

pub fn unescape(raw: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(raw.len());
    unescape_into(raw, &mut out)?;
    Ok(out)
}

/// Escapes every reserved byte from `start` onwards; bytes before `start`
/// are copied as they are.
pub fn escape_from(frame: &[u8], start: usize) -> Vec<u8> {
    let start = start.min(frame.len());
    let (head, tail) = frame.split_at(start);

    let mut out = Vec::with_capacity(frame.len() + 8);
    out.extend_from_slice(head);
    for &byte in tail {
        if needs_escape(byte) {
            out.push(ESCAPE);
            out.push(byte ^ 0x20);
        } else {
            out.push(byte);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescapes_both_special_forms() {
        let raw = [0x7d, 0x5e, 0x41, 0x7d, 0x5d, 0x42];
        assert_eq!(unescape(&raw).unwrap(), vec![0x7e, 0x41, 0x7d, 0x42]);
    }

    #[test]
    fn unescapes_xor_form() {
        assert_eq!(unescape(&[0x7d, 0x31, 0x7d, 0x33]).unwrap(), vec![0x11, 0x13]);
    }

    #[test]
    fn appends_to_existing_buffer() {
        let mut out = vec![0x7e, 0x10, 0x00];
        unescape_into(&[0x01, 0x7d, 0x5e], &mut out).unwrap();
        assert_eq!(out, vec![0x7e, 0x10, 0x00, 0x01, 0x7e]);
    }

    #[test]
    fn trailing_escape_is_an_error() {
        match unescape(&[0x41, 0x7d]) {
            Err(FrameError::TruncatedEscape { offset }) => assert_eq!(offset, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn header_bytes_are_left_alone() {
        let mut frame = vec![0x7e; 19];
        frame.extend_from_slice(&[0x7e, 0x11, 0x55]);
        let escaped = escape_from(&frame, 19);

        assert_eq!(&escaped[..19], &frame[..19]);
        assert_eq!(&escaped[19..], &[0x7d, 0x5e, 0x7d, 0x31, 0x55]);
    }

    #[test]
    fn round_trip() {
        let payload: Vec<u8> = (0..=255).collect();
        let escaped = escape_from(&payload, 0);
        assert!(escaped.len() > payload.len());
        assert!(!escaped.contains(&0x7e));
        assert_eq!(unescape(&escaped).unwrap(), payload);
    }
}
