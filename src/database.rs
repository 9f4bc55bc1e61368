use crate::prelude::*;

use chrono::{Local, NaiveDate};
use sqlx::{any::AnyConnectOptions, Any, Pool, Row};
use std::sync::{Arc, RwLock};

use crate::almanac::SunTimes;
use crate::utils::DATETIME_FORMAT;

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 2;

const DATE_FORMAT: &str = "%Y-%m-%d";

enum DatabaseType {
    MySQL,
    SQLite,
}

/// A DayData row not yet sent to PVOutput.
#[derive(Clone, Debug, PartialEq)]
pub struct UnpostedRow {
    /// Local `YYYY-MM-DD HH:MM:SS`
    pub datetime: String,
    /// Lifetime energy, Wh
    pub total_energy: u64,
    /// W
    pub current_power: i64,
}

#[derive(Clone, Debug)]
pub struct Database {
    config: config::Database,
    pool: Arc<RwLock<Option<Pool<Any>>>>,
}

impl Database {
    pub fn new(config: config::Database) -> Self {
        Self {
            config,
            pool: Arc::new(RwLock::new(None)),
        }
    }

    fn database(&self) -> Result<DatabaseType> {
        let prefix: Vec<&str> = self.config.url().splitn(2, ':').collect();
        match prefix[0] {
            "sqlite" => Ok(DatabaseType::SQLite),
            "mysql" => Ok(DatabaseType::MySQL),
            _ => Err(anyhow!("database.rs:unsupported database {}", self.config.url())),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        // fail early on a url we have no migrations for
        self.database()?;

        sqlx::any::install_default_drivers();
        let options = AnyConnectOptions::from_str(self.config.url())?;
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await?;
        *self.pool.write().map_err(|_| anyhow!("Failed to acquire write lock"))? = Some(pool);

        info!("connected to database {}", self.config.url());
        Ok(())
    }

    pub async fn connection(&self) -> Result<Pool<Any>> {
        match &*self.pool.read().map_err(|_| anyhow!("Failed to acquire read lock"))? {
            Some(pool) => Ok(pool.clone()),
            None => Err(anyhow!("database.rs:Database not connected")),
        }
    }

    /// Creates or upgrades the tables.
    pub async fn migrate(&self) -> Result<()> {
        use DatabaseType::*;

        let pool = self.connection().await?;

        // work out migration directory to use based on database url
        let migrator = match self.database()? {
            SQLite => sqlx::migrate!("db/migrations/sqlite"),
            MySQL => sqlx::migrate!("db/migrations/mysql"),
        };

        migrator.run(&pool).await?;
        info!("database schema is up to date");

        Ok(())
    }

    pub async fn schema(&self) -> Result<u32> {
        let pool = self.connection().await?;

        let data: Option<String> = sqlx::query("SELECT Data FROM Settings WHERE Value = 'Schema'")
            .fetch_optional(&pool)
            .await?
            .map(|row| row.try_get::<String, _>(0))
            .transpose()?;

        match data {
            Some(version) => version
                .trim()
                .parse()
                .map_err(|_| anyhow!("database.rs:bad schema version {:?}", version)),
            None => bail!("database has no schema version, run with --install"),
        }
    }

    /// Fails unless the schema matches this build.
    pub async fn check_schema(&self) -> Result<()> {
        let version = self.schema().await?;
        if version != SCHEMA_VERSION {
            bail!(
                "database schema is version {}, expected {}; run with --update",
                version,
                SCHEMA_VERSION
            );
        }
        Ok(())
    }

    pub async fn fetch_almanac(&self, date: NaiveDate) -> Result<Option<SunTimes>> {
        let pool = self.connection().await?;

        let row = sqlx::query("SELECT Sunrise, Sunset FROM Almanac WHERE Date = ?")
            .bind(date.format(DATE_FORMAT).to_string())
            .fetch_optional(&pool)
            .await?;

        match row {
            Some(row) => Ok(Some(SunTimes {
                sunrise: row.try_get(0)?,
                sunset: row.try_get(1)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn update_almanac(&self, date: NaiveDate, times: &SunTimes) -> Result<()> {
        let pool = self.connection().await?;

        sqlx::query("REPLACE INTO Almanac (Date, Sunrise, Sunset) VALUES (?, ?, ?)")
            .bind(date.format(DATE_FORMAT).to_string())
            .bind(times.sunrise.clone())
            .bind(times.sunset.clone())
            .execute(&pool)
            .await?;

        debug!("almanac for {} set to {}-{}", date, times.sunrise, times.sunset);
        Ok(())
    }

    /// Latest interval stored before `before` (a local datetime string).
    pub async fn last_recorded_interval(&self, before: &str) -> Result<Option<String>> {
        let pool = self.connection().await?;

        let row = sqlx::query("SELECT MAX(DateTime) FROM DayData WHERE DateTime < ?")
            .bind(before.to_string())
            .fetch_one(&pool)
            .await?;

        Ok(row.try_get::<Option<String>, _>(0)?)
    }

    /// Stores one archive interval, retrying with backoff.
    pub async fn set_interval_value(&self, record: &IntervalRecord) -> Result<()> {
        let mut retry_count = 0;
        let max_retries = 3;
        let mut backoff = 1;

        loop {
            match self.insert_interval(record).await {
                Ok(()) => return Ok(()),
                Err(err) if retry_count + 1 < max_retries => {
                    error!("REPLACE failed: {:?} - retrying in {}s", err, backoff);
                    tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                    retry_count += 1;
                    backoff *= 2;
                }
                Err(err) => {
                    error!("Failed to store interval after {} attempts", max_retries);
                    return Err(err);
                }
            }
        }
    }

    async fn insert_interval(&self, record: &IntervalRecord) -> Result<()> {
        let pool = self.connection().await?;
        let mut conn = pool.acquire().await?;

        sqlx::query(
            "REPLACE INTO DayData (DateTime, Inverter, Serial, CurrentPower, ETotalToday) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Utils::format_local(record.timestamp)?)
        .bind(record.inverter.clone())
        .bind(record.serial as i64)
        .bind(record.current_power)
        .bind(kwh(record.total_energy))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Stores a run's archive. The first interval is only the baseline the
    /// others are measured from and is skipped. Returns the number stored.
    pub async fn store_intervals(&self, records: &[IntervalRecord]) -> Result<usize> {
        let mut stored = 0;
        for record in records.iter().skip(1) {
            self.set_interval_value(record).await?;
            stored += 1;
        }
        info!("stored {} intervals", stored);
        Ok(stored)
    }

    /// Lifetime energy (Wh) at the first reading on `day`.
    pub async fn start_of_day_energy(&self, day: NaiveDate) -> Result<Option<u64>> {
        let pool = self.connection().await?;
        let (start, end) = day_bounds(day);

        let row = sqlx::query(
            "SELECT ETotalToday FROM DayData WHERE DateTime >= ? AND DateTime < ? ORDER BY DateTime ASC LIMIT 1",
        )
        .bind(start)
        .bind(end)
        .fetch_optional(&pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get::<Option<f64>, _>(0)?.map(wh)),
            None => Ok(None),
        }
    }

    pub async fn unposted_data(&self, from: &str) -> Result<Vec<UnpostedRow>> {
        let pool = self.connection().await?;

        let rows = sqlx::query(
            "SELECT DateTime, ETotalToday, CurrentPower FROM DayData \
             WHERE DateTime >= ? AND PVOutput IS NULL AND CurrentPower > 0 ORDER BY DateTime ASC",
        )
        .bind(from.to_string())
        .fetch_all(&pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<UnpostedRow> {
                Ok(UnpostedRow {
                    datetime: row.try_get(0)?,
                    total_energy: wh(row.try_get::<Option<f64>, _>(1)?.unwrap_or_default()),
                    current_power: row.try_get(2)?,
                })
            })
            .collect()
    }

    /// Marks rows between `from` and `to` inclusive as posted now.
    pub async fn set_data_posted(&self, from: &str, to: &str) -> Result<u64> {
        let pool = self.connection().await?;
        let now = Local::now().format(DATETIME_FORMAT).to_string();

        let result = sqlx::query("UPDATE DayData SET PVOutput = ? WHERE DateTime >= ? AND DateTime <= ?")
            .bind(now)
            .bind(from.to_string())
            .bind(to.to_string())
            .execute(&pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn kwh(wh: u64) -> f64 {
    wh as f64 / 1000.0
}

fn wh(kwh: f64) -> u64 {
    (kwh * 1000.0).round().max(0.0) as u64
}

fn day_bounds(day: NaiveDate) -> (String, String) {
    let next = day.succ_opt().unwrap_or(day);
    (
        format!("{} 00:00:00", day.format(DATE_FORMAT)),
        format!("{} 00:00:00", next.format(DATE_FORMAT)),
    )
}
