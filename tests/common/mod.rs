#![allow(dead_code)]

use sma_bridge::sma::codes::InverterCodes;
use sma_bridge::sma::escape;
use sma_bridge::sma::session::{Delays, SessionSettings};
use sma_bridge::sma::stream::{FIRST_PAYLOAD_OFFSET, RECORD_COUNT_OFFSET};
use std::time::Duration;

pub const REPORT_TIME: i64 = 1_717_243_200;

/// Wire bytes for a received frame whose unescaped form is `data`, plus the
/// marker when `terminated`. The declared length counts the escaped bytes,
/// as the inverter sends it.
pub fn wire(data: &[u8], terminated: bool) -> Vec<u8> {
    let mut raw = vec![0x7e, 0x00, 0x00];
    raw.extend(escape::escape_from(&data[3..], 0));
    if terminated {
        raw.push(0x7e);
    }
    raw[1] = raw.len() as u8;
    raw
}

/// Unescaped frame content starting with `7e ll 00 00` and `tag` at offset 4.
pub fn frame(tag: &[u8], len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len.max(4 + tag.len())];
    data[0] = 0x7e;
    data[4..4 + tag.len()].copy_from_slice(tag);
    data
}

/// First frame of a stream carrying `payload`, with `togo` records queued.
/// Two checksum bytes follow the payload so the trailer is cut off cleanly.
pub fn stream_frame(tag: &[u8], togo: u16, payload: &[u8]) -> Vec<u8> {
    let mut data = frame(tag, FIRST_PAYLOAD_OFFSET);
    data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 2].copy_from_slice(&togo.to_le_bytes());
    data.extend_from_slice(payload);
    data.extend_from_slice(&[0xaa, 0xbb]);
    wire(&data, true)
}

pub fn archive_entry(timestamp: u32, total_wh: u64) -> Vec<u8> {
    let mut b = timestamp.to_le_bytes().to_vec();
    b.extend_from_slice(&total_wh.to_le_bytes());
    b
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        inverter: "SB3000".to_string(),
        address: [0x53, 0xac, 0x1d, 0x25, 0x80, 0x00],
        password: "0000".to_string(),
        codes: InverterCodes {
            code: [0x01, 0x02, 0x03, 0x04],
            archive_code: 0x4e,
        },
        timeout: Duration::from_millis(10),
        report_time: REPORT_TIME,
        date_from: REPORT_TIME - 3600,
        date_to: REPORT_TIME,
        timezone: [0x0e, 0x11],
        delays: Delays::none(),
    }
}
