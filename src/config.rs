use crate::prelude::*;

use serde::Deserialize;
use std::fmt;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverter: Inverter,
    pub location: Option<Location>,
    pub database: Option<Database>,
    pub pvoutput: Option<PvOutput>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    /// Optional path to write decoded records to, one JSON object per line
    pub datalog_file: Option<String>,
}

/// Where the inverter link is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// An RFCOMM tty such as /dev/rfcomm0
    Device(String),
    /// A TCP serial bridge
    Tcp { host: String, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Device(path) => write!(f, "{}", path),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    /// Section name in the inverter code table
    pub name: String,
    pub address: String,

    pub device: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,

    #[serde(default = "Config::default_timeout")]
    pub timeout: u64,
    #[serde(default = "Config::default_password")]
    pub password: String,
    #[serde(default = "Config::default_script")]
    pub script: String,
    #[serde(default = "Config::default_codes_file")]
    pub codes_file: String,
    #[serde(default = "Config::default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "Config::default_retry_backoff")]
    pub retry_backoff: u64,
}

impl Inverter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        match (&self.device, &self.host, self.port) {
            (Some(device), None, None) => Ok(Endpoint::Device(device.clone())),
            (None, Some(host), Some(port)) => Ok(Endpoint::Tcp {
                host: host.clone(),
                port,
            }),
            _ => Err(anyhow!(
                "config.rs:inverter needs either device or host and port"
            )),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn codes_file(&self) -> &str {
        &self.codes_file
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff)
    }
} // }}}

// Location {{{
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }
} // }}}

// Database {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Database {
    pub url: String,
}

impl Database {
    pub fn url(&self) -> &str {
        &self.url
    }
} // }}}

// PvOutput {{{
#[derive(Clone, Debug, Deserialize)]
pub struct PvOutput {
    #[serde(default = "Config::default_pvoutput_url")]
    pub url: String,
    pub key: String,
    pub sid: String,
}

impl PvOutput {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies command line overrides, then checks the result again.
    pub fn apply_options(&mut self, options: &Options) -> Result<()> {
        if let Some(address) = &options.address {
            self.inverter.address = address.clone();
        }
        if let Some(password) = &options.password {
            self.inverter.password = password.clone();
        }
        if let Some(name) = &options.inverter {
            self.inverter.name = name.clone();
        }
        if let Some(script) = &options.script {
            self.inverter.script = script.clone();
        }
        if let Some(timeout) = options.timeout {
            self.inverter.timeout = timeout;
        }

        match (options.latitude, options.longitude, &mut self.location) {
            (None, None, _) => {}
            (Some(latitude), Some(longitude), location) => {
                *location = Some(Location {
                    latitude,
                    longitude,
                })
            }
            (latitude, longitude, Some(location)) => {
                location.latitude = latitude.unwrap_or(location.latitude);
                location.longitude = longitude.unwrap_or(location.longitude);
            }
            (_, _, None) => bail!("--latitude and --longitude must be given together"),
        }

        self.validate()
    }

    pub fn log_settings(&self) {
        info!("Configuration loaded successfully:");
        info!("  Inverter: {}", self.inverter.name);
        info!("    Address: {}", self.inverter.address);
        match self.inverter.endpoint() {
            Ok(endpoint) => info!("    Link: {}", endpoint),
            Err(_) => info!("    Link: unset"),
        }
        info!("    Timeout: {}s", self.inverter.timeout);
        info!("    Script: {}", self.inverter.script);
        info!("    Codes File: {}", self.inverter.codes_file);
        info!("    Connect Attempts: {}", self.inverter.connect_attempts);
        info!("    Retry Backoff: {}s", self.inverter.retry_backoff);

        info!("  Location: {}", if self.location.is_some() { "enabled" } else { "disabled" });
        if let Some(location) = &self.location {
            info!("    Latitude: {}", location.latitude);
            info!("    Longitude: {}", location.longitude);
        }

        info!("  Database: {}", if self.database.is_some() { "enabled" } else { "disabled" });
        if let Some(db) = &self.database {
            info!("    URL: {}", db.url);
        }

        info!("  PVOutput: {}", if self.pvoutput.is_some() { "enabled" } else { "disabled" });
        if let Some(pv) = &self.pvoutput {
            info!("    URL: {}", pv.url);
            info!("    System ID: {}", pv.sid);
        }

        if let Some(datalog) = &self.datalog_file {
            info!("  Datalog File: {}", datalog);
        }
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        self.inverter.endpoint()?;

        if let Some(port) = self.inverter.port {
            if port == 0 {
                bail!("inverter.port must be between 1 and 65535");
            }
        }
        if self.inverter.timeout == 0 {
            return Err(anyhow!("config.rs:Invalid inverter timeout: 0"));
        }
        if self.inverter.connect_attempts == 0 {
            return Err(anyhow!("config.rs:inverter.connect_attempts must be at least 1"));
        }
        sma::session::parse_address(&self.inverter.address)?;

        if let Some(location) = &self.location {
            if !(-90.0..=90.0).contains(&location.latitude) {
                bail!("location.latitude {} out of range", location.latitude);
            }
            if !(-180.0..=180.0).contains(&location.longitude) {
                bail!("location.longitude {} out of range", location.longitude);
            }
        }

        if let Some(db) = &self.database {
            if let Err(e) = url::Url::parse(db.url()) {
                return Err(anyhow!("config.rs:Invalid database URL: {}", e));
            }
        }

        if let Some(pv) = &self.pvoutput {
            if let Err(e) = url::Url::parse(pv.url()) {
                return Err(anyhow!("config.rs:Invalid PVOutput URL: {}", e));
            }
            if pv.key.is_empty() || pv.sid.is_empty() {
                return Err(anyhow!("config.rs:PVOutput key and sid cannot be empty"));
            }
        }

        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_timeout() -> u64 {
        30
    }

    fn default_password() -> String {
        "0000".to_string()
    }

    fn default_script() -> String {
        "sma.in.new".to_string()
    }

    fn default_codes_file() -> String {
        "invcode.in".to_string()
    }

    fn default_connect_attempts() -> u32 {
        19
    }

    fn default_retry_backoff() -> u64 {
        10
    }

    fn default_pvoutput_url() -> String {
        "http://pvoutput.org/service/r2/addstatus.jsp".to_string()
    }
}
