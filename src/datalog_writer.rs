use crate::prelude::*;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sma::records::SpotValue;

/// Appends decoded records to a file as JSON lines.
#[derive(Debug, Clone)]
pub struct DatalogWriter {
    file: Arc<Mutex<std::fs::File>>,
    path: String,
    values_written: Arc<Mutex<u64>>,
}

impl DatalogWriter {
    pub fn new(path: &str) -> Result<Self> {
        info!("Opening datalog file at {}", path);

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to open datalog file {}: {}", path, e);
                return Err(e.into());
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
                error!("Failed to set permissions on datalog file {}: {}", path, e);
                return Err(e.into());
            }
        }

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_string(),
            values_written: Arc::new(Mutex::new(0)),
        })
    }

    /// Writes the archive intervals and spot values of one run.
    pub fn write_report(&self, report: &ExchangeReport) -> Result<()> {
        let logged_at = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();

        let mut lines = Vec::with_capacity(report.archive.len() + report.spot.len());
        for record in &report.archive {
            lines.push(Self::interval_line(logged_at, record)?);
        }
        for value in &report.spot {
            lines.push(Self::spot_line(logged_at, report.serial, value)?);
        }

        self.write_lines(&lines)
    }

    fn interval_line(logged_at: u64, record: &IntervalRecord) -> Result<String> {
        let mut json = serde_json::Map::new();
        json.insert("utc_timestamp".to_string(), logged_at.into());
        json.insert("type".to_string(), "interval".into());
        json.insert("data".to_string(), serde_json::to_value(record)?);
        json.insert("datetime".to_string(), Utils::describe_timestamp(record.timestamp).into());

        Ok(serde_json::to_string(&serde_json::Value::Object(json))?)
    }

    fn spot_line(logged_at: u64, serial: Option<u32>, value: &SpotValue) -> Result<String> {
        let mut json = serde_json::Map::new();
        json.insert("utc_timestamp".to_string(), logged_at.into());
        json.insert("type".to_string(), "spot".into());
        json.insert("serial".to_string(), serial.into());
        json.insert("data".to_string(), serde_json::to_value(value)?);

        Ok(serde_json::to_string(&serde_json::Value::Object(json))?)
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let mut file = self.file.lock().map_err(|_| anyhow!("Failed to lock datalog file"))?;
        for line in lines {
            if let Err(e) = writeln!(file, "{}", line) {
                error!("Failed to write to datalog file {}: {}", self.path, e);
                return Err(e.into());
            }
        }
        if let Err(e) = file.flush() {
            error!("Failed to flush datalog file {}: {}", self.path, e);
            return Err(e.into());
        }

        let mut values_written = self
            .values_written
            .lock()
            .map_err(|_| anyhow!("Failed to lock values counter"))?;
        *values_written += lines.len() as u64;
        info!("Total values stored in datalog file: {}", *values_written);

        Ok(())
    }
}
