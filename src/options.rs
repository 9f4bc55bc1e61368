use clap::{ArgAction, Parser};

/// SMA Bridge - polls an SMA inverter over Bluetooth and stores its readings
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Log more; repeat for trace output
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Poll even when it is dark
    #[clap(long)]
    pub force: bool,

    /// Talk to the inverter but store nothing
    #[clap(long)]
    pub test: bool,

    /// Upload unposted rows from --from instead of the last 14 days
    #[clap(long)]
    pub repost: bool,

    /// Create the database tables and exit
    #[clap(long)]
    pub install: bool,

    /// Upgrade the database tables and exit
    #[clap(long)]
    pub update: bool,

    /// Start of the archive range, "YYYY-MM-DD HH:MM:SS"
    #[clap(long)]
    pub from: Option<String>,

    /// End of the archive range, "YYYY-MM-DD HH:MM:SS"
    #[clap(long)]
    pub to: Option<String>,

    /// Inverter Bluetooth address, overrides the config file
    #[clap(short = 'i', long)]
    pub address: Option<String>,

    /// Inverter user password
    #[clap(short = 'p', long)]
    pub password: Option<String>,

    /// Inverter type, as named in the code table
    #[clap(long)]
    pub inverter: Option<String>,

    /// Conversation script to run
    #[clap(short = 'f', long)]
    pub script: Option<String>,

    /// Read timeout in seconds
    #[clap(long)]
    pub timeout: Option<u64>,

    #[clap(long, allow_hyphen_values = true)]
    pub latitude: Option<f64>,

    #[clap(long, allow_hyphen_values = true)]
    pub longitude: Option<f64>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }

    /// Log filter after applying -v flags to the configured level.
    pub fn log_level<'a>(&self, configured: &'a str) -> &'a str {
        match self.verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::parse_from(["sma-bridge"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.config_file, "config.yaml");
        assert_eq!(options.verbose, 0);
        assert!(!options.force && !options.test && !options.repost);
        assert!(options.from.is_none());
    }

    #[test]
    fn verbosity_raises_log_level() {
        let options = Options::parse_from(["sma-bridge", "-vv"]);
        assert_eq!(options.verbose, 2);
        assert_eq!(options.log_level("warn"), "trace");
        assert_eq!(Options::default().log_level("warn"), "warn");
    }

    #[test]
    fn range_and_negative_coordinates() {
        let options = Options::parse_from([
            "sma-bridge",
            "--from",
            "2024-06-01 00:00:00",
            "--to",
            "2024-06-02 00:00:00",
            "--longitude",
            "-0.12",
            "--latitude",
            "51.5",
        ]);
        assert_eq!(options.from.as_deref(), Some("2024-06-01 00:00:00"));
        assert_eq!(options.longitude, Some(-0.12));
        assert_eq!(options.latitude, Some(51.5));
    }
}
