use std::fmt;

use crate::error::ExchangeError;

/// Part of the exchange a failure happened in. Each has its own tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Exchange,
    Timestamp,
    Archive,
}

impl Phase {
    /// Failures tolerated before the run is abandoned.
    pub fn limit(self) -> u32 {
        match self {
            Phase::Exchange => 60,
            Phase::Timestamp => 10,
            Phase::Archive => 3,
        }
    }

    /// Whether to wait for the backoff period before rewinding.
    pub fn backs_off(self) -> bool {
        !matches!(self, Phase::Timestamp)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Exchange => "exchange",
            Phase::Timestamp => "timestamp",
            Phase::Archive => "archive",
        };
        f.write_str(name)
    }
}

/// Script position to resume from after a failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Index of the next directive to run.
    pub index: usize,
    /// Byte offset of that directive in the script file.
    pub offset: usize,
    /// 1-based line number, for logging.
    pub line: usize,
}

/// Failure count shared by every phase of one run.
#[derive(Clone, Debug, Default)]
pub struct RetryBudget {
    failures: u32,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Counts one failure in `phase`; errors once the phase limit is passed.
    pub fn record(&mut self, phase: Phase) -> Result<u32, ExchangeError> {
        self.failures += 1;

        let limit = phase.limit();
        if self.failures > limit {
            return Err(ExchangeError::RetriesExhausted {
                phase,
                failures: self.failures,
                limit,
            });
        }

        Ok(self.failures)
    }
}
