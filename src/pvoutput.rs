use crate::prelude::*;

use chrono::{NaiveDate, NaiveDateTime};

use crate::database::UnpostedRow;
use crate::utils::DATETIME_FORMAT;

/// Most statuses the service takes in one request.
pub const BATCH_SIZE: usize = 30;

/// Uploads stored intervals to PVOutput's add-status service.
#[derive(Clone, Debug)]
pub struct PvOutput {
    config: config::PvOutput,
    client: reqwest::Client,
    pause: Duration,
}

impl PvOutput {
    pub fn new(config: config::PvOutput) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            pause: Duration::from_secs(2),
        }
    }

    /// Wait between requests; the service rejects more than one a second.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Posts every unposted interval from `from` on and marks what the
    /// service accepted. Returns the number of intervals posted.
    pub async fn post_unposted(&self, database: &Database, from: &str) -> Result<usize> {
        let rows = database.unposted_data(from).await?;
        if rows.is_empty() {
            debug!("nothing to post since {}", from);
            return Ok(0);
        }
        info!("posting {} intervals to {}", rows.len(), self.config.url());

        let mut posted = 0;
        let mut day: Option<NaiveDate> = None;
        let mut start_of_day = 0;

        for batch in rows.chunks(BATCH_SIZE) {
            let mut data = String::new();
            for row in batch {
                let datetime = parse_datetime(&row.datetime)?;
                if day != Some(datetime.date()) {
                    start_of_day = database
                        .start_of_day_energy(datetime.date())
                        .await?
                        .unwrap_or(row.total_energy);
                    day = Some(datetime.date());
                }
                data.push_str(&status(row, &datetime, start_of_day));
            }

            if let Err(err) = self.send(&data).await {
                error!("PVOutput post failed: {:#}", err);
                break;
            }

            // chunks are never empty
            if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
                database.set_data_posted(&first.datetime, &last.datetime).await?;
            }
            posted += batch.len();

            tokio::time::sleep(self.pause).await;
        }

        info!("posted {} intervals", posted);
        Ok(posted)
    }

    async fn send(&self, data: &str) -> Result<()> {
        let url = reqwest::Url::parse(&format!("{}?data={}", self.config.url(), data))?;
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .header("X-Pvoutput-Apikey", self.config.key())
            .header("X-Pvoutput-SystemId", self.config.sid())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("pvoutput.rs:{} {}", status, body.trim());
        }

        debug!("PVOutput replied {}", body.trim());
        Ok(())
    }
}

fn parse_datetime(datetime: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(datetime, DATETIME_FORMAT)
        .with_context(|| format!("bad DayData datetime {:?}", datetime))
}

/// One `date,time,energy,power;` entry; energy counts from the start of the
/// day.
fn status(row: &UnpostedRow, datetime: &NaiveDateTime, start_of_day: u64) -> String {
    format!(
        "{},{},{},{};",
        datetime.format("%Y%m%d"),
        datetime.format("%H:%M"),
        row.total_energy as i64 - start_of_day as i64,
        row.current_power
    )
}
