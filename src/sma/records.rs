use crate::prelude::*;

use nom_derive::{Nom, Parse};
use num_enum::TryFromPrimitive;
use serde::Serialize;

use super::units::UnitTable;
use crate::error::DecodeError;

/// Seconds between archive samples.
pub const ARCHIVE_INTERVAL: i64 = 300;
pub const ARCHIVE_RECORD_LEN: usize = 12;

/// One archived interval, as handed to storage and upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntervalRecord {
    pub timestamp: i64,
    pub inverter: String,
    pub serial: u32,
    /// Average power over the interval, W.
    pub current_power: i64,
    /// Lifetime energy at the end of the interval, Wh.
    pub total_energy: u64,
}

/// A decoded spot (live) value.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpotValue {
    pub timestamp: i64,
    pub key1: u8,
    pub key2: u8,
    pub raw: u32,
    pub description: Option<String>,
    pub units: Option<String>,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub lifetime_wh: u32,
    pub today_wh: u32,
}

/// Spot record stride, selected by the tag byte at offset 3 of the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum RecordLayout {
    Compact = 0x00,
    Extended = 0x08,
    ExtendedAlt = 0x10,
    CompactAlt = 0x40,
}

impl RecordLayout {
    pub fn stride(self) -> usize {
        match self {
            RecordLayout::Compact | RecordLayout::CompactAlt => 28,
            RecordLayout::Extended | RecordLayout::ExtendedAlt => 40,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Nom)]
#[nom(LittleEndian)]
pub struct SpotRecord {
    pub class: u8,
    pub key1: u8,
    pub key2: u8,
    pub kind: u8,
    pub timestamp: u32,
    #[nom(Parse = "nom::number::complete::le_u24")]
    pub raw: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Nom)]
#[nom(LittleEndian)]
pub struct ArchiveEntry {
    pub timestamp: u32,
    pub total: u64,
}

/// Time string block sent back with `$TIMESTRING`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeString {
    pub marker: [u8; 2],
    pub text: [u8; 24],
    pub timeset: [u8; 4],
    pub inverter_time: i64,
}

impl TimeString {
    pub fn is_valid(&self) -> bool {
        self.marker == [0x6d, 0x23]
    }
}

pub fn field<'a>(buf: &'a [u8], field: &'static str, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
    let end = offset + len;
    buf.get(offset..end).ok_or(DecodeError::OutOfRange {
        field,
        offset,
        end,
        len: buf.len(),
    })
}

/// Little endian unsigned value.
pub fn le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Like [`le`], but a field of all 0xff means "no value" and reads as 0.
pub fn nullable_le(bytes: &[u8]) -> u64 {
    if bytes.iter().all(|&b| b == 0xff) {
        return 0;
    }
    le(bytes)
}

fn nullable(value: u64, width: usize) -> u64 {
    let max = if width >= 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 };
    if value == max {
        0
    } else {
        value
    }
}

pub fn serial(stream: &[u8]) -> Result<[u8; 4], DecodeError> {
    let bytes = field(stream, "serial", 16, 4)?;
    Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn inverter_time(received: &[u8]) -> Result<i64, DecodeError> {
    Ok(nullable_le(field(received, "inverter time", 63, 4)?) as i64)
}

pub fn channel(received: &[u8]) -> Result<u8, DecodeError> {
    Ok(field(received, "channel", 22, 1)?[0])
}

pub fn inverter_code(received: &[u8]) -> Result<u8, DecodeError> {
    Ok(field(received, "inverter code", 22, 1)?[0])
}

pub fn address2(received: &[u8]) -> Result<[u8; 6], DecodeError> {
    let bytes = field(received, "second address", 26, 6)?;
    let mut address = [0u8; 6];
    address.copy_from_slice(bytes);
    Ok(address)
}

/// Link quality, 0-100.
pub fn signal_percent(received: &[u8]) -> Result<f64, DecodeError> {
    Ok(field(received, "signal", 22, 1)?[0] as f64 * 100.0 / 255.0)
}

pub fn totals(received: &[u8]) -> Result<Totals, DecodeError> {
    Ok(Totals {
        lifetime_wh: le(field(received, "lifetime total", 67, 3)?) as u32,
        today_wh: le(field(received, "today total", 83, 2)?) as u32,
    })
}

pub fn time_string(received: &[u8]) -> Result<TimeString, DecodeError> {
    let marker = field(received, "time string marker", 60, 2)?;
    let text = field(received, "time string", 63, 24)?;
    let timeset = field(received, "time setting", 79, 4)?;

    let mut out = TimeString {
        marker: [marker[0], marker[1]],
        text: [0u8; 24],
        timeset: [0u8; 4],
        inverter_time: nullable_le(&text[..4]) as i64,
    };
    out.text.copy_from_slice(text);
    out.timeset.copy_from_slice(timeset);
    Ok(out)
}

/// Decodes every spot record of a stream, using the layout tag for the
/// record stride.
pub fn spot_values(stream: &[u8], units: &UnitTable) -> Result<Vec<SpotValue>, DecodeError> {
    let tag = field(stream, "layout tag", 3, 1)?[0];
    let layout = RecordLayout::try_from(tag).map_err(|_| DecodeError::UnknownLayout(tag))?;

    let mut values = Vec::new();
    for offset in (0..stream.len()).step_by(layout.stride()) {
        let Ok((_, record)) = SpotRecord::parse(&stream[offset..]) else {
            // trailing partial record
            break;
        };

        let raw = nullable(record.raw as u64, 3) as u32;
        let unit = units.lookup(record.key1, record.key2);
        values.push(SpotValue {
            timestamp: nullable(record.timestamp as u64, 4) as i64,
            key1: record.key1,
            key2: record.key2,
            raw,
            description: unit.map(|u| u.description.clone()),
            units: unit.map(|u| u.units.clone()),
            value: unit.map(|u| u.scale(raw)).unwrap_or(raw as f64),
        });
    }

    Ok(values)
}

/// Printable text starting at `offset`, up to the first NUL.
pub fn text_at(stream: &[u8], offset: usize) -> String {
    let bytes = stream.get(offset..).unwrap_or_default();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}

/// Whole 12-byte archive entries of one page; a partial trailing entry is
/// dropped.
pub fn archive_entries(page: &[u8]) -> Vec<ArchiveEntry> {
    page.chunks_exact(ARCHIVE_RECORD_LEN)
        .filter_map(|chunk| ArchiveEntry::parse(chunk).ok())
        .map(|(_, entry)| ArchiveEntry {
            timestamp: nullable(entry.timestamp as u64, 4) as u32,
            total: nullable(entry.total, 8),
        })
        .collect()
}

pub fn validate_interval(previous: i64, current: i64) -> Result<(), DecodeError> {
    if current != previous + ARCHIVE_INTERVAL {
        return Err(DecodeError::ArchiveGap { previous, current });
    }
    Ok(())
}

/// Turns consecutive archive entries, possibly spread over several pages,
/// into interval records.
#[derive(Clone, Debug)]
pub struct ArchiveAccumulator {
    inverter: String,
    serial: u32,
    previous: Option<ArchiveEntry>,
    records: Vec<IntervalRecord>,
}

impl ArchiveAccumulator {
    pub fn new(inverter: &str, serial: u32) -> Self {
        Self {
            inverter: inverter.to_string(),
            serial,
            previous: None,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ArchiveEntry) -> Result<(), DecodeError> {
        let timestamp = entry.timestamp as i64;
        let (previous_time, previous_total) = match self.previous {
            Some(p) => (p.timestamp as i64, p.total),
            None => (timestamp - ARCHIVE_INTERVAL, entry.total),
        };

        validate_interval(previous_time, timestamp)?;

        // Wh over five minutes, times twelve, is the average W
        let current_power = (entry.total as i64 - previous_total as i64) * 12;
        info!(
            "{} total={:.3} kWh current={} W",
            Utils::describe_timestamp(timestamp),
            entry.total as f64 / 1000.0,
            current_power
        );

        self.records.push(IntervalRecord {
            timestamp,
            inverter: self.inverter.clone(),
            serial: self.serial,
            current_power,
            total_energy: entry.total,
        });
        self.previous = Some(entry);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<IntervalRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_bytes(timestamp: u32, total: u64) -> Vec<u8> {
        let mut b = timestamp.to_le_bytes().to_vec();
        b.extend_from_slice(&total.to_le_bytes());
        b
    }

    #[test]
    fn null_fields_read_as_zero() {
        assert_eq!(le(&[0xff, 0xff]), 0xffff);
        assert_eq!(nullable_le(&[0xff, 0xff, 0xff]), 0);
        assert_eq!(nullable_le(&[0x10, 0x27, 0x00]), 10000);
        assert_eq!(nullable(0xffff_ffff, 4), 0);
        assert_eq!(nullable(u64::MAX, 8), 0);
    }

    #[test]
    fn interval_validation() {
        assert!(validate_interval(1_000, 1_300).is_ok());
        assert!(matches!(
            validate_interval(1_000, 1_301),
            Err(DecodeError::ArchiveGap { previous: 1_000, current: 1_301 })
        ));
    }

    #[test]
    fn archive_entries_drop_partial_tail() {
        let mut page = entry_bytes(1_700_000_100, 5_000);
        page.extend(entry_bytes(1_700_000_400, 5_025));
        page.extend_from_slice(&[1, 2, 3]);

        let entries = archive_entries(&page);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].timestamp, 1_700_000_400);
        assert_eq!(entries[1].total, 5_025);
    }

    #[test]
    fn accumulator_computes_average_power() -> Result<()> {
        let mut acc = ArchiveAccumulator::new("SB3000", 2_100_123_456);
        for entry in archive_entries(&[
            entry_bytes(1_700_000_100, 5_000),
            entry_bytes(1_700_000_400, 5_025),
            entry_bytes(1_700_000_700, 5_100),
        ]
        .concat())
        {
            acc.push(entry)?;
        }

        let records = acc.into_records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].current_power, 0);
        assert_eq!(records[1].current_power, 300);
        assert_eq!(records[2].current_power, 900);
        assert_eq!(records[2].total_energy, 5_100);
        assert_eq!(records[2].serial, 2_100_123_456);
        Ok(())
    }

    #[test]
    fn accumulator_rejects_gap() {
        let mut acc = ArchiveAccumulator::new("SB3000", 1);
        let entries = archive_entries(&[entry_bytes(1_000_200, 1), entry_bytes(1_000_501, 2)].concat());

        assert!(acc.push(entries[0]).is_ok());
        assert!(acc.push(entries[1]).is_err());
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn spot_values_follow_layout_stride() {
        let mut stream = vec![0u8; 56];
        stream[3] = 0x00;
        for (i, (key2, raw)) in [(0x26u8, 1234u32), (0x27, 0xffffff)].iter().enumerate() {
            let base = i * 28;
            stream[base + 1] = 0x40;
            stream[base + 2] = *key2;
            stream[base + 4..base + 8].copy_from_slice(&1_700_000_000u32.to_le_bytes());
            stream[base + 8..base + 11].copy_from_slice(&raw.to_le_bytes()[..3]);
        }
        // record 0 shares its tag byte with the layout
        stream[3] = 0x00;

        let units = UnitTable::parse(":unit conversions\n40 26 \"Total Power\" W 1\n:end unit conversions\n");
        let values = spot_values(&stream, &units).unwrap();

        assert_eq!(values.len(), 2);
        assert_eq!(values[0].description.as_deref(), Some("Total Power"));
        assert_eq!(values[0].value, 1234.0);
        assert_eq!(values[0].timestamp, 1_700_000_000);
        assert_eq!(values[1].raw, 0);
        assert_eq!(values[1].description, None);
    }

    #[test]
    fn unknown_layout_is_rejected() {
        let stream = [0u8, 0, 0, 0x22, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            spot_values(&stream, &UnitTable::default()),
            Err(DecodeError::UnknownLayout(0x22))
        ));
    }

    #[test]
    fn layout_strides() {
        let stride = |tag: u8| RecordLayout::try_from(tag).ok().map(RecordLayout::stride);
        assert_eq!(stride(0x08), Some(40));
        assert_eq!(stride(0x10), Some(40));
        assert_eq!(stride(0x40), Some(28));
        assert_eq!(stride(0x00), Some(28));
        assert_eq!(stride(0x01), None);
    }

    #[test]
    fn received_fields() {
        let mut received = vec![0u8; 90];
        received[22] = 0xff;
        received[26..32].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        received[60] = 0x6d;
        received[61] = 0x23;
        received[63..67].copy_from_slice(&1_700_000_000u32.to_le_bytes());
        received[67..70].copy_from_slice(&[0x40, 0x42, 0x0f]);
        received[83..85].copy_from_slice(&[0xe8, 0x03]);

        assert_eq!(channel(&received).unwrap(), 0xff);
        assert_eq!(signal_percent(&received).unwrap(), 100.0);
        assert_eq!(address2(&received).unwrap(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(inverter_time(&received).unwrap(), 1_700_000_000);
        assert_eq!(
            totals(&received).unwrap(),
            Totals { lifetime_wh: 1_000_000, today_wh: 1_000 }
        );

        let ts = time_string(&received).unwrap();
        assert!(ts.is_valid());
        assert_eq!(ts.inverter_time, 1_700_000_000);
        assert_eq!(&ts.text[..4], &1_700_000_000u32.to_le_bytes());
    }

    #[test]
    fn totals_are_read_raw() {
        let mut received = vec![0u8; 90];
        received[67..70].copy_from_slice(&[0xff, 0xff, 0xff]);
        received[83..85].copy_from_slice(&[0xff, 0xff]);

        assert_eq!(
            totals(&received).unwrap(),
            Totals { lifetime_wh: 0xff_ffff, today_wh: 0xffff }
        );
    }

    #[test]
    fn short_buffer_reports_field() {
        match serial(&[0u8; 10]) {
            Err(DecodeError::OutOfRange { field, end, len, .. }) => {
                assert_eq!(field, "serial");
                assert_eq!(end, 20);
                assert_eq!(len, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn text_stops_at_nul() {
        assert_eq!(text_at(b"xxSB 3000\0junk", 2), "SB 3000");
        assert_eq!(text_at(b"ab", 5), "");
    }
}
