use crate::prelude::*;

use serde::Serialize;

use super::codes::InverterCodes;
use super::reader::{Frame, LinkReader};
use super::records::{self, ArchiveAccumulator, SpotValue, Totals};
use super::retry::{Checkpoint, Phase, RetryBudget};
use super::script::{Directive, Line, Marker, Placeholder, Script, Token};
use super::stream::{Reassembler, Stream};
use super::transport::Transport;
use super::units::UnitTable;
use super::{escape, fcs, length, PAYLOAD_OFFSET};
use crate::error::{DecodeError, ExchangeError, FrameError, LinkError};

/// Replies that match nothing in one `R` before the link is considered lost.
pub const MAX_UNMATCHED: usize = 50;
const PASSWORD_LEN: usize = 12;
const TIME_STRING_LEN: usize = 25;
const DEFAULT_TIMESET: [u8; 4] = [0x30, 0xfe, 0x7e, 0x00];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delays {
    /// Wait before rewinding after a failure.
    pub retry: Duration,
    /// Pause at `:startsetup`.
    pub setup: Duration,
    /// Pause when the inverter clock lags the report time.
    pub slow_clock: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(10),
            setup: Duration::from_secs(1),
            slow_clock: Duration::from_secs(5),
        }
    }
}

impl Delays {
    pub fn none() -> Self {
        Self {
            retry: Duration::ZERO,
            setup: Duration::ZERO,
            slow_clock: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub inverter: String,
    /// Bluetooth address in wire order (reversed).
    pub address: [u8; 6],
    pub password: String,
    pub codes: InverterCodes,
    pub timeout: Duration,
    pub report_time: i64,
    pub date_from: i64,
    pub date_to: i64,
    pub timezone: [u8; 2],
    pub delays: Delays,
}

/// Everything decoded during one complete run of a script.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ExchangeReport {
    pub serial: Option<u32>,
    pub inverter_time: Option<i64>,
    pub totals: Option<Totals>,
    pub signal: Option<f64>,
    pub inverter_code: Option<u8>,
    pub spot: Vec<SpotValue>,
    /// Archive intervals in time order, the first being the baseline
    /// reading.
    pub archive: Vec<IntervalRecord>,
    pub failures: u32,
}

/// One conversation with the inverter, driven by a script.
pub struct Session<T: Transport> {
    transport: T,
    settings: SessionSettings,
    units: UnitTable,
    reader: LinkReader,
    reassembler: Reassembler,

    received: Frame,
    last_sent: Vec<u8>,

    serial: [u8; 4],
    address2: [u8; 6],
    channel: u8,
    inverter_code: u8,
    time_string: [u8; TIME_STRING_LEN],
    timeset: [u8; 4],
    send_count: u8,

    report: ExchangeReport,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, settings: SessionSettings, units: UnitTable) -> Self {
        let reader = LinkReader::new(settings.timeout);

        Self {
            transport,
            settings,
            units,
            reader,
            reassembler: Reassembler::new(reader),
            received: Frame::default(),
            last_sent: Vec::new(),
            serial: [0; 4],
            address2: [0; 6],
            channel: 0,
            inverter_code: 0,
            time_string: [0; TIME_STRING_LEN],
            timeset: DEFAULT_TIMESET,
            send_count: 0,
            report: ExchangeReport::default(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Runs `script` to the end. A recoverable failure rewinds to the last
    /// checkpoint; the run is abandoned once the failing phase's limit is
    /// passed, or straight away on a fatal error.
    pub fn run(&mut self, script: &Script) -> Result<ExchangeReport, ExchangeError> {
        let mut budget = RetryBudget::new();
        let mut checkpoint = Checkpoint::default();
        let mut index = 0;

        while let Some(line) = script.lines().get(index) {
            match self.execute(line) {
                Ok(()) => {
                    if let Directive::Marker(marker) = line.directive {
                        if marker.is_checkpoint() {
                            checkpoint = script.checkpoint_after(index);
                            debug!("[{}] checkpoint {:?}", line.number, marker);
                        }
                    }
                    index += 1;
                }
                Err(err) => {
                    let Some(phase) = err.retry_phase() else {
                        error!("[{}] {}", line.number, err);
                        return Err(err);
                    };
                    warn!(
                        "[{}] {}; resuming after line {}",
                        line.number, err, checkpoint.line
                    );
                    self.resync(&mut budget, phase)?;
                    index = checkpoint.index;
                }
            }
        }

        self.report.failures = budget.failures();
        info!(
            "exchange complete: {} spot values, {} archive records, {} failures",
            self.report.spot.len(),
            self.report.archive.len(),
            self.report.failures
        );

        Ok(std::mem::take(&mut self.report))
    }

    fn resync(&mut self, budget: &mut RetryBudget, phase: Phase) -> Result<(), ExchangeError> {
        self.received = Frame::default();
        self.report.archive.clear();

        let failures = budget.record(phase)?;
        debug!("{} failure {} of {}", phase, failures, phase.limit());

        if phase.backs_off() {
            std::thread::sleep(self.settings.delays.retry);
        }
        Ok(())
    }

    fn execute(&mut self, line: &Line) -> Result<(), ExchangeError> {
        match &line.directive {
            Directive::Receive(tokens) => {
                let expected = self.build(tokens)?;
                debug!("[{}] waiting for {}", line.number, Utils::hex(&expected));
                self.receive(&expected, line.number)
            }
            Directive::Send(tokens) => {
                let frame = self.build(tokens)?;
                debug!("[{}] sending {}", line.number, Utils::hex(&frame));
                self.send(frame)
            }
            Directive::Extract(placeholders) => {
                for &placeholder in placeholders {
                    trace!("[{}] extracting {}", line.number, placeholder);
                    self.extract(placeholder)?;
                }
                Ok(())
            }
            Directive::Marker(Marker::StartSetup) => {
                std::thread::sleep(self.settings.delays.setup);
                Ok(())
            }
            Directive::Marker(_) => Ok(()),
        }
    }

    fn receive(&mut self, expected: &[u8], number: usize) -> Result<(), ExchangeError> {
        let mut unmatched = 0;

        loop {
            self.received = self
                .reader
                .read_frame(&mut self.transport, &self.last_sent)
                .map_err(|e| ExchangeError::link(Phase::Exchange, e))?;

            if reply_matches(expected, &self.received.data) {
                debug!("[{}] found expected reply", number);
                return Ok(());
            }

            unmatched += 1;
            debug!("[{}] reply does not match ({})", number, unmatched);
            if unmatched > MAX_UNMATCHED {
                return Err(ExchangeError::link(Phase::Exchange, LinkError::Unmatched(unmatched)));
            }
        }
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<(), ExchangeError> {
        self.last_sent = frame;
        self.transport
            .write_all(&self.last_sent)
            .map_err(|e| ExchangeError::link(Phase::Exchange, e))
    }

    fn build(&mut self, tokens: &[Token]) -> Result<Vec<u8>, ExchangeError> {
        let mut frame = Vec::with_capacity(128);

        for token in tokens {
            let placeholder = match token {
                Token::Byte(b) => {
                    frame.push(*b);
                    continue;
                }
                Token::Placeholder(p) => *p,
            };

            match placeholder {
                Placeholder::Addr => frame.extend_from_slice(&self.settings.address),
                Placeholder::Ser => frame.extend_from_slice(&self.serial),
                Placeholder::Add2 => frame.extend_from_slice(&self.address2),
                Placeholder::Chan => frame.push(self.channel),
                Placeholder::Time => push_time(&mut frame, self.settings.report_time),
                Placeholder::TimeMinus => push_time(&mut frame, self.settings.report_time - 1),
                Placeholder::TimePlus => push_time(&mut frame, self.settings.report_time + 1),
                // the first archive record is a baseline, so start one interval early
                Placeholder::TimeFrom1 => {
                    push_time(&mut frame, self.settings.date_from - records::ARCHIVE_INTERVAL)
                }
                Placeholder::TimeTo1 => push_time(&mut frame, self.settings.date_to),
                Placeholder::TimeFrom2 => push_time(&mut frame, self.settings.date_from - 86400),
                Placeholder::TimeTo2 => push_time(&mut frame, self.settings.date_to - 86400),
                Placeholder::TimeString => frame.extend_from_slice(&self.time_string),
                Placeholder::TimeSet => frame.extend_from_slice(&self.timeset),
                Placeholder::Password => frame.extend(encode_password(&self.settings.password)),
                Placeholder::Unknown => frame.extend_from_slice(&self.settings.codes.code),
                Placeholder::InvCode => frame.push(self.inverter_code),
                Placeholder::ArchCode => frame.push(self.settings.codes.archive_code),
                Placeholder::Cnt => {
                    self.send_count = self.send_count.wrapping_add(1);
                    frame.push(self.send_count);
                }
                Placeholder::Timezone => frame.extend_from_slice(&self.settings.timezone),
                Placeholder::Crc => frame = seal_frame(&frame)?,
                Placeholder::Pow
                | Placeholder::Dtot
                | Placeholder::ITime
                | Placeholder::TestData
                | Placeholder::ArchiveData1
                | Placeholder::Signal
                | Placeholder::InverterData => {
                    warn!("{} has no outgoing value", placeholder);
                }
            }
        }

        Ok(frame)
    }

    fn read_stream(&mut self, phase: Phase) -> Result<Stream, ExchangeError> {
        self.reassembler
            .read(&mut self.transport, &mut self.received, &self.last_sent)
            .map_err(|e| ExchangeError::link(phase, e))
    }

    fn extract(&mut self, placeholder: Placeholder) -> Result<(), ExchangeError> {
        let decode = |e: DecodeError| ExchangeError::decode(Phase::Exchange, e);

        match placeholder {
            Placeholder::Ser => {
                let stream = self.read_stream(Phase::Exchange)?;
                self.serial = records::serial(&stream.data).map_err(decode)?;
                let serial = u32::from_le_bytes(self.serial);
                info!("serial {}", serial);
                self.report.serial = Some(serial);
            }
            Placeholder::ITime => {
                let time = records::inverter_time(&self.received.data).map_err(decode)?;
                info!("inverter time {}", Utils::describe_timestamp(time));
                self.report.inverter_time = Some(time);
            }
            Placeholder::Pow | Placeholder::InverterData => {
                let stream = self.read_stream(Phase::Exchange)?;
                let values = records::spot_values(&stream.data, &self.units).map_err(decode)?;
                if placeholder == Placeholder::InverterData && !values.is_empty() {
                    info!("inverter {}", records::text_at(&stream.data, 8));
                }
                for v in &values {
                    match (&v.description, &v.units) {
                        (Some(description), Some(units)) => info!(
                            "{} {:<20} = {:.0} {}",
                            Utils::describe_timestamp(v.timestamp),
                            description,
                            v.value,
                            units
                        ),
                        _ => info!(
                            "{} no unit for {:02x} {:02x} = {}",
                            Utils::describe_timestamp(v.timestamp),
                            v.key1,
                            v.key2,
                            v.raw
                        ),
                    }
                }
                self.report.spot.extend(values);
            }
            Placeholder::Dtot => {
                let totals = records::totals(&self.received.data).map_err(decode)?;
                info!(
                    "lifetime total {:.2} kWh, today {:.2} kWh",
                    totals.lifetime_wh as f64 / 1000.0,
                    totals.today_wh as f64 / 1000.0
                );
                self.report.totals = Some(totals);
            }
            Placeholder::Add2 => {
                self.address2 = records::address2(&self.received.data).map_err(decode)?;
                debug!("second address {}", Utils::hex(&self.address2));
            }
            Placeholder::Chan => {
                self.channel = records::channel(&self.received.data).map_err(decode)?;
                debug!("bluetooth channel {}", self.channel);
            }
            Placeholder::Signal => {
                let signal = records::signal_percent(&self.received.data).map_err(decode)?;
                info!("bluetooth signal {:.0}%", signal);
                self.report.signal = Some(signal);
            }
            Placeholder::InvCode => {
                self.inverter_code = records::inverter_code(&self.received.data).map_err(decode)?;
                debug!("inverter code {:02x}", self.inverter_code);
                self.report.inverter_code = Some(self.inverter_code);
            }
            Placeholder::TimeString => self.extract_time_string()?,
            Placeholder::TestData => {
                let stream = self.read_stream(Phase::Exchange)?;
                debug!("discarded {} bytes of test data", stream.data.len());
            }
            Placeholder::ArchiveData1 => self.extract_archive()?,
            other => warn!("{} has nothing to extract", other),
        }

        Ok(())
    }

    fn extract_time_string(&mut self) -> Result<(), ExchangeError> {
        let decode = |e: DecodeError| ExchangeError::decode(Phase::Timestamp, e);

        let ts = records::time_string(&self.received.data).map_err(decode)?;
        if !ts.is_valid() {
            return Err(decode(DecodeError::TimeStringMarker(ts.marker[0], ts.marker[1])));
        }

        self.time_string[..ts.text.len()].copy_from_slice(&ts.text);
        self.timeset = ts.timeset;
        debug!("time string {}", Utils::hex(&ts.text));

        if self.settings.report_time > ts.inverter_time {
            debug!("inverter clock behind, waiting {:?}", self.settings.delays.slow_clock);
            std::thread::sleep(self.settings.delays.slow_clock);
        }
        Ok(())
    }

    fn extract_archive(&mut self) -> Result<(), ExchangeError> {
        let mut archive = ArchiveAccumulator::new(&self.settings.inverter, u32::from_le_bytes(self.serial));

        loop {
            let stream = self.read_stream(Phase::Archive)?;
            for entry in records::archive_entries(&stream.data) {
                archive
                    .push(entry)
                    .map_err(|e| ExchangeError::decode(Phase::Archive, e))?;
            }

            if stream.togo == 0 {
                break;
            }

            debug!("{} archive records to go", stream.togo);
            self.received = self
                .reader
                .read_frame(&mut self.transport, &self.last_sent)
                .map_err(|e| ExchangeError::link(Phase::Archive, e))?;
        }

        info!("{} archive records", archive.len());
        self.report.archive.extend(archive.into_records());
        Ok(())
    }
}

fn push_time(frame: &mut Vec<u8>, time: i64) {
    frame.extend_from_slice(&(time as u32).to_le_bytes());
}

/// True when `received` carries the bytes `expected` holds from offset 4 on.
/// The first four bytes hold the length and companion and are not compared.
pub fn reply_matches(expected: &[u8], received: &[u8]) -> bool {
    if expected.len() <= 4 {
        return true;
    }
    received.len() >= expected.len() && expected[4..] == received[4..expected.len()]
}

/// Appends the checksum, escapes the payload and stamps the send length.
pub fn seal_frame(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    if frame.len() < PAYLOAD_OFFSET {
        return Err(FrameError::TooShort { len: frame.len() });
    }

    let mut sealed = frame.to_vec();
    sealed.extend_from_slice(&fcs::frame_check_sequence(&frame[PAYLOAD_OFFSET..]));

    let mut sealed = escape::escape_from(&sealed, PAYLOAD_OFFSET);
    length::fix_send(&mut sealed)?;
    Ok(sealed)
}

pub fn encode_password(password: &str) -> [u8; PASSWORD_LEN] {
    let mut encoded = [0x88u8; PASSWORD_LEN];
    for (slot, byte) in encoded.iter_mut().zip(password.bytes()) {
        *slot = ((byte as u32 + 0x88) % 0xff) as u8;
    }
    encoded
}

/// Wire form of a UTC offset: big endian `offset + 1` in 16 bits.
pub fn timezone_bytes(offset_secs: i64) -> [u8; 2] {
    let tz = (offset_secs + 1).rem_euclid(65536) as u16;
    tz.to_be_bytes()
}

/// Parses `AA:BB:CC:DD:EE:FF` into wire order.
pub fn parse_address(address: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = address.split(':').collect();
    if parts.len() != 6 {
        bail!("bluetooth address {} must have six parts", address);
    }

    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().rev().zip(&parts) {
        *slot = u8::from_str_radix(part, 16).with_context(|| format!("bad bluetooth address {}", address))?;
    }
    Ok(out)
}
