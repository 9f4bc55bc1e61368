pub use anyhow::{anyhow, bail, Context, Error, Result};
pub use log::{debug, error, info, trace, warn};

pub use std::str::FromStr;
pub use std::time::Duration;

pub use crate::config::{self, Config};
pub use crate::database::Database;
pub use crate::options::Options;
pub use crate::sma::{self, records::IntervalRecord, session::ExchangeReport};
pub use crate::utils::Utils;
