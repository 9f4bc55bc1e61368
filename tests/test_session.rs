mod common;
use common::*;

use sma_bridge::error::{ExchangeError, FrameError};
use sma_bridge::sma::records::Totals;
use sma_bridge::sma::retry::Phase;
use sma_bridge::sma::script::Script;
use sma_bridge::sma::session::Session;
use sma_bridge::sma::transport::ReplayTransport;
use sma_bridge::sma::units::UnitTable;

const SCRIPT: &str = "\
:init
R 7E 00 00 00 01 02 $END;
E $CHAN $SIGNAL $END;
S 7E 10 00 00 $ADDR $CHAN $CNT $CNT $END;
:setup
R 7E 00 00 00 0A 0B $END;
E $SER $END;
:getrangedata
S 7E 20 00 00 $SER $TIMEFROM1 $TIMETO1 $END;
R 7E 00 00 00 0C 0D $END;
E $ARCHIVEDATA1 $END;
";

const SERIAL: u32 = 2_100_123_456;
const FIRST: u32 = (REPORT_TIME - 3900) as u32;

fn init_reply() -> Vec<u8> {
    let mut data = frame(&[0x01, 0x02], 30);
    data[22] = 0xcc;
    wire(&data, true)
}

fn setup_reply() -> Vec<u8> {
    let mut payload = vec![0u8; 24];
    payload[16..20].copy_from_slice(&SERIAL.to_le_bytes());
    stream_frame(&[0x0a, 0x0b], 0, &payload)
}

fn archive_pages() -> Vec<Vec<u8>> {
    let mut first = archive_entry(FIRST, 1_000_000);
    first.extend(archive_entry(FIRST + 300, 1_000_100));
    vec![
        stream_frame(&[0x0c, 0x0d], 1, &first),
        stream_frame(&[0xee, 0xee], 0, &archive_entry(FIRST + 600, 1_000_250)),
    ]
}

fn session(transport: ReplayTransport) -> Session<ReplayTransport> {
    Session::new(transport, settings(), UnitTable::default())
}

#[test]
fn complete_run() -> Result<(), ExchangeError> {
    let script = Script::parse(SCRIPT)?;
    let mut t = ReplayTransport::new();
    t.push(init_reply()).push(setup_reply());
    for page in archive_pages() {
        t.push(page);
    }

    let mut session = session(t);
    let report = session.run(&script)?;

    assert_eq!(report.serial, Some(SERIAL));
    assert_eq!(report.signal, Some(80.0));
    assert_eq!(report.failures, 0);

    let powers: Vec<i64> = report.archive.iter().map(|r| r.current_power).collect();
    assert_eq!(powers, vec![0, 1200, 1800]);
    assert_eq!(report.archive[2].timestamp, (FIRST + 600) as i64);
    assert_eq!(report.archive[2].total_energy, 1_000_250);
    assert!(report.archive.iter().all(|r| r.serial == SERIAL && r.inverter == "SB3000"));

    let sent = session.transport().sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[0],
        vec![0x7e, 0x10, 0x00, 0x00, 0x53, 0xac, 0x1d, 0x25, 0x80, 0x00, 0xcc, 0x01, 0x02]
    );

    let mut range = vec![0x7e, 0x20, 0x00, 0x00];
    range.extend_from_slice(&SERIAL.to_le_bytes());
    range.extend_from_slice(&((REPORT_TIME - 3600 - 300) as u32).to_le_bytes());
    range.extend_from_slice(&(REPORT_TIME as u32).to_le_bytes());
    assert_eq!(sent[1], range);

    assert!(session.transport().is_drained());
    Ok(())
}

#[test]
fn timeout_rewinds_to_checkpoint() -> Result<(), ExchangeError> {
    let script = Script::parse(SCRIPT)?;
    let mut t = ReplayTransport::new();
    t.push(init_reply()).push(setup_reply()).push_silence();
    for page in archive_pages() {
        t.push(page);
    }

    let mut session = session(t);
    let report = session.run(&script)?;

    assert_eq!(report.failures, 1);
    assert_eq!(report.archive.len(), 3);

    // init is not repeated, the range request is
    let sent = session.transport().sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[1], sent[2]);
    Ok(())
}

#[test]
fn archive_gap_exhausts_budget() -> Result<(), ExchangeError> {
    let script = Script::parse(SCRIPT)?;
    let mut gap = archive_entry(FIRST, 1_000_000);
    gap.extend(archive_entry(FIRST + 600, 1_000_100));

    let mut t = ReplayTransport::new();
    t.push(init_reply()).push(setup_reply());
    for _ in 0..4 {
        t.push(stream_frame(&[0x0c, 0x0d], 0, &gap));
    }

    match session(t).run(&script) {
        Err(ExchangeError::RetriesExhausted { phase, failures, limit }) => {
            assert_eq!(phase, Phase::Archive);
            assert_eq!(failures, 4);
            assert_eq!(limit, 3);
        }
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}

#[test]
fn unmatched_replies_are_skipped() -> Result<(), ExchangeError> {
    let script = Script::parse(":init\nR 7E 00 00 00 01 02 $END;\nE $CHAN $END;\n")?;
    let mut t = ReplayTransport::new();
    t.push(wire(&frame(&[0x09, 0x09], 30), true)).push(init_reply());

    let report = session(t).run(&script)?;
    assert_eq!(report.failures, 0);
    Ok(())
}

#[test]
fn unsendable_frame_is_fatal() -> Result<(), ExchangeError> {
    let script = Script::parse(":init\nS 7E 00 $CRC $END;\n")?;

    match session(ReplayTransport::new()).run(&script) {
        Err(ExchangeError::Frame(FrameError::TooShort { len: 2 })) => {}
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}

const TIME_SCRIPT: &str = "\
:init
S 7E 30 00 00 $TIMESET $END;
R 7E 00 00 00 01 02 $END;
E $TIMESTRING $DTOT $END;
S 7E 31 00 00 $TIMESET $TIMESTRING $END;
";

/// The 24 bytes following the time string marker. The first four hold the
/// inverter clock.
fn time_text() -> Vec<u8> {
    let mut text: Vec<u8> = (0x40..0x58).collect();
    text[..4].copy_from_slice(&((REPORT_TIME + 60) as u32).to_le_bytes());
    text
}

fn time_reply(marker: [u8; 2]) -> Vec<u8> {
    let mut data = frame(&[0x01, 0x02], 90);
    data[60..62].copy_from_slice(&marker);
    data[63..87].copy_from_slice(&time_text());
    wire(&data, true)
}

#[test]
fn time_string_is_sent_back() -> Result<(), ExchangeError> {
    let script = Script::parse(TIME_SCRIPT)?;
    let mut t = ReplayTransport::new();
    t.push(time_reply([0x6d, 0x23]));

    let mut session = session(t);
    let report = session.run(&script)?;

    assert_eq!(report.failures, 0);
    // lifetime total overlaps bytes 4..7 of the text, today 20..22
    assert_eq!(
        report.totals,
        Some(Totals {
            lifetime_wh: 0x46_4544,
            today_wh: 0x5554
        })
    );

    let sent = session.transport().sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], vec![0x7e, 0x30, 0x00, 0x00, 0x30, 0xfe, 0x7e, 0x00]);

    let mut expected = vec![0x7e, 0x31, 0x00, 0x00, 0x50, 0x51, 0x52, 0x53];
    expected.extend(time_text());
    expected.push(0x00);
    assert_eq!(sent[1], expected);
    Ok(())
}

#[test]
fn bad_time_marker_is_retried() -> Result<(), ExchangeError> {
    let script = Script::parse(TIME_SCRIPT)?;
    let mut t = ReplayTransport::new();
    t.push(time_reply([0x6d, 0x24])).push(time_reply([0x6d, 0x23]));

    let mut session = session(t);
    let report = session.run(&script)?;

    assert_eq!(report.failures, 1);
    assert!(report.totals.is_some());

    // the rewind repeats the first send with the default setting
    let sent = session.transport().sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(&sent[2][4..8], &[0x50, 0x51, 0x52, 0x53]);
    Ok(())
}

#[test]
fn bad_time_markers_exhaust_budget() -> Result<(), ExchangeError> {
    let script = Script::parse(TIME_SCRIPT)?;
    let mut t = ReplayTransport::new();
    for _ in 0..11 {
        t.push(time_reply([0x00, 0x00]));
    }

    match session(t).run(&script) {
        Err(ExchangeError::RetriesExhausted { phase, failures, limit }) => {
            assert_eq!(phase, Phase::Timestamp);
            assert_eq!(failures, 11);
            assert_eq!(limit, 10);
        }
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}

const SPOT_SCRIPT: &str = "\
:init
R 7E 00 00 00 01 02 $END;
E $TESTDATA $END;
:setup
R 7E 00 00 00 03 04 $END;
E $POW $END;

:unit conversions
40 26 \"Total Power\" W 1
:end unit conversions
";

fn spot_record(key2: u8, raw: u32) -> Vec<u8> {
    let mut record = vec![0x01, 0x40, key2, 0x00];
    record.extend_from_slice(&(REPORT_TIME as u32).to_le_bytes());
    record.extend_from_slice(&raw.to_le_bytes()[..3]);
    record.resize(28, 0);
    record
}

#[test]
fn spot_values_through_script() -> Result<(), ExchangeError> {
    let script = Script::parse(SPOT_SCRIPT)?;
    let mut spot = spot_record(0x26, 1_480);
    spot.extend(spot_record(0x27, 0xff_ffff));

    let mut t = ReplayTransport::new();
    t.push(stream_frame(&[0x01, 0x02], 0, &[0x11; 20]))
        .push(stream_frame(&[0x03, 0x04], 0, &spot));

    let mut session = Session::new(t, settings(), UnitTable::parse(SPOT_SCRIPT));
    let report = session.run(&script)?;

    assert_eq!(report.spot.len(), 2);
    assert_eq!(report.spot[0].timestamp, REPORT_TIME);
    assert_eq!(report.spot[0].description.as_deref(), Some("Total Power"));
    assert_eq!(report.spot[0].units.as_deref(), Some("W"));
    assert_eq!(report.spot[0].value, 1_480.0);

    // no conversion, and an all-0xff value reads as zero
    assert_eq!(report.spot[1].key2, 0x27);
    assert!(report.spot[1].description.is_none());
    assert_eq!(report.spot[1].raw, 0);

    assert!(session.transport().is_drained());
    Ok(())
}
