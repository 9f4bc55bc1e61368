pub mod almanac;
pub mod config;
pub mod database;
pub mod datalog_writer;
pub mod error;
pub mod options;
pub mod prelude;
pub mod pvoutput;
pub mod sma;
pub mod utils;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start of the archive range when nothing has been stored yet.
const EPOCH_FROM: &str = "2000-01-01 00:00:00";

/// How far back unposted rows are uploaded.
const PVOUTPUT_DAYS: u64 = 14;

use crate::prelude::*;

use chrono::{Datelike, Local};
use std::io::Write;

use crate::datalog_writer::DatalogWriter;
use crate::pvoutput::PvOutput;
use crate::sma::codes::InverterCodes;
use crate::sma::script::Script;
use crate::sma::session::{self, Delays, Session, SessionSettings};
use crate::sma::transport::Link;
use crate::sma::units::UnitTable;

fn init_logging(level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {}", e);
    }
}

/// One polling run: read the inverter archive for the pending range, store
/// it, then upload to PVOutput.
pub async fn app() -> Result<()> {
    let options = Options::new();

    let mut config = match Config::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            init_logging(options.log_level("info"));
            return Err(err.context(format!("Failed to load config {}", options.config_file)));
        }
    };
    init_logging(options.log_level(&config.loglevel));
    config.apply_options(&options)?;

    info!("sma-bridge {} starting", CARGO_PKG_VERSION);
    config.log_settings();

    let codes = InverterCodes::load(config.inverter.codes_file(), config.inverter.name())?;

    let database = match &config.database {
        Some(db) => {
            let database = Database::new(db.clone());
            database.connect().await?;
            Some(database)
        }
        None => None,
    };

    if options.install || options.update {
        let database = database.ok_or_else(|| anyhow!("--install and --update need a database"))?;
        database.migrate().await?;
        return Ok(());
    }
    if let Some(database) = &database {
        database.check_schema().await?;
    }

    let now = Local::now();
    let (date_from, date_to) = date_range(&options, database.as_ref(), &now).await?;
    info!(
        "archive range {} to {}",
        Utils::describe_timestamp(date_from),
        Utils::describe_timestamp(date_to)
    );

    if !options.force && !almanac::daylight(database.as_ref(), config.location.as_ref(), &now).await? {
        info!("it is dark, nothing to do");
        return Ok(());
    }

    let (script, script_text) = Script::load(config.inverter.script())?;
    let units = UnitTable::parse(&script_text);

    let settings = SessionSettings {
        inverter: config.inverter.name().to_string(),
        address: session::parse_address(config.inverter.address())?,
        password: config.inverter.password().to_string(),
        codes,
        timeout: config.inverter.timeout(),
        report_time: now.timestamp(),
        date_from,
        date_to,
        timezone: session::timezone_bytes(Utils::standard_utc_offset(now.year())),
        delays: Delays {
            retry: config.inverter.retry_backoff(),
            ..Delays::default()
        },
    };

    let inverter = config.inverter.clone();
    let exchange = tokio::task::spawn_blocking(move || -> Result<ExchangeReport> {
        let link = Link::open(&inverter.endpoint()?, inverter.connect_attempts(), inverter.timeout())?;
        let mut session = Session::new(link, settings, units);
        Ok(session.run(&script)?)
    });

    let report = tokio::select! {
        joined = exchange => joined??,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };
    log_report(&report);

    if options.test {
        info!("test run, nothing stored");
        return Ok(());
    }

    if let Some(database) = &database {
        database.store_intervals(&report.archive).await?;
    }

    if let Some(path) = &config.datalog_file {
        DatalogWriter::new(path)?.write_report(&report)?;
    }

    if let (Some(database), Some(pvoutput)) = (&database, &config.pvoutput) {
        let from = match (&options.from, options.repost) {
            (Some(from), true) => from.clone(),
            _ => {
                let start = now.date_naive() - chrono::Days::new(PVOUTPUT_DAYS);
                format!("{} 00:00:00", start.format("%Y-%m-%d"))
            }
        };
        PvOutput::new(pvoutput.clone()).post_unposted(database, &from).await?;
    }

    Ok(())
}

/// Explicit `--from`/`--to`, otherwise from the last stored interval up to
/// now rounded down to the minute. Without a database the run starts at
/// today's midnight.
async fn date_range(
    options: &Options,
    database: Option<&Database>,
    now: &chrono::DateTime<Local>,
) -> Result<(i64, i64)> {
    let date_to = match &options.to {
        Some(to) => Utils::parse_local(to)?,
        None => now.timestamp() - now.timestamp().rem_euclid(60),
    };

    let date_from = match (&options.from, database) {
        (Some(from), _) => Utils::parse_local(from)?,
        (None, Some(database)) => {
            let before = Utils::format_local(date_to)?;
            let last = database.last_recorded_interval(&before).await?;
            Utils::parse_local(last.as_deref().unwrap_or(EPOCH_FROM))?
        }
        (None, None) => Utils::parse_local(&format!("{} 00:00:00", now.format("%Y-%m-%d")))?,
    };

    if date_from > date_to {
        bail!(
            "range starts after it ends: {} > {}",
            Utils::describe_timestamp(date_from),
            Utils::describe_timestamp(date_to)
        );
    }

    Ok((date_from, date_to))
}

fn log_report(report: &ExchangeReport) {
    if let Some(serial) = report.serial {
        info!("serial number {}", serial);
    }
    if let Some(time) = report.inverter_time {
        info!("inverter clock {}", Utils::describe_timestamp(time));
    }
    if let Some(totals) = &report.totals {
        info!(
            "energy today {:.3} kWh, lifetime {:.3} kWh",
            totals.today_wh as f64 / 1000.0,
            totals.lifetime_wh as f64 / 1000.0
        );
    }
    if let Some(signal) = report.signal {
        info!("signal strength {:.1}%", signal);
    }
    for value in &report.spot {
        debug!(
            "{} {:.2} {}",
            value.description.as_deref().unwrap_or("?"),
            value.value,
            value.units.as_deref().unwrap_or("")
        );
    }
    if let (Some(first), Some(last)) = (report.archive.first(), report.archive.last()) {
        info!(
            "{} archive intervals {} to {}",
            report.archive.len(),
            Utils::describe_timestamp(first.timestamp),
            Utils::describe_timestamp(last.timestamp)
        );
    }
    if report.failures > 0 {
        warn!("run needed {} retries", report.failures);
    }
}
