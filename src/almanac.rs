use crate::prelude::*;

use chrono::{DateTime, Datelike, Local};

/// Sun's zenith at sunrise/sunset, degrees; includes refraction.
const ZENITH: f64 = 91.0;

/// Local sunrise and sunset as `HH:MM`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SunTimes {
    pub sunrise: String,
    pub sunset: String,
}

impl SunTimes {
    /// Computes the times for the day of `now` at `location`, in the UTC
    /// offset in force at `now`.
    pub fn calculate(location: &config::Location, now: &DateTime<Local>) -> Self {
        let day = now.ordinal0() as f64;
        let offset = now.offset().local_minus_utc() as f64 / 3600.0;

        Self {
            sunrise: event(location.latitude(), location.longitude(), day, offset, true),
            sunset: event(location.latitude(), location.longitude(), day, offset, false),
        }
    }

    /// True when `hhmm` lies between sunrise and sunset, inclusive.
    pub fn is_light(&self, hhmm: &str) -> bool {
        hhmm >= self.sunrise.as_str() && hhmm <= self.sunset.as_str()
    }
}

fn event(latitude: f64, longitude: f64, day: f64, offset: f64, rising: bool) -> String {
    let lng_hour = longitude / 15.0;
    let t = day + ((if rising { 6.0 } else { 18.0 }) - lng_hour) / 24.0;

    // mean anomaly
    let m = 0.9856 * t - 3.289;

    // true longitude
    let l = (m + 1.916 * m.to_radians().sin() + 0.020 * (2.0 * m).to_radians().sin() + 282.634).rem_euclid(360.0);

    // right ascension, in the same quadrant as l, in hours
    let mut ra = (0.91764 * l.to_radians().tan()).atan().to_degrees();
    ra += (l / 90.0).floor() * 90.0 - (ra / 90.0).floor() * 90.0;
    let ra = ra / 15.0;

    let sin_dec = 0.39782 * l.to_radians().sin();
    let cos_dec = sin_dec.asin().cos();

    let mut cos_h = (ZENITH.to_radians().cos() - sin_dec * latitude.to_radians().sin())
        / (cos_dec * latitude.to_radians().cos());
    if !(-1.0..=1.0).contains(&cos_h) {
        warn!(
            "sun never {} at latitude {} on day {}",
            if cos_h > 1.0 { "rises" } else { "sets" },
            latitude,
            day
        );
        cos_h = cos_h.clamp(-1.0, 1.0);
    }

    let h = (if rising {
        360.0 - cos_h.acos().to_degrees()
    } else {
        cos_h.acos().to_degrees()
    }) / 15.0;

    let local_mean = h + ra - 0.06571 * t - 6.622;
    let ut = (local_mean - lng_hour).rem_euclid(24.0);
    let local = (ut + offset).rem_euclid(24.0);

    format!("{:02}:{:02}", local.floor() as u32, ((local - local.floor()) * 60.0).floor() as u32)
}

/// Decides whether the inverter is worth polling now. Without a location or a
/// database there is nothing to decide from, so the answer is yes.
pub async fn daylight(
    database: Option<&Database>,
    location: Option<&config::Location>,
    now: &DateTime<Local>,
) -> Result<bool> {
    let (Some(database), Some(location)) = (database, location) else {
        return Ok(true);
    };

    let today = now.date_naive();
    let times = match database.fetch_almanac(today).await? {
        Some(times) => times,
        None => {
            let times = SunTimes::calculate(location, now);
            database.update_almanac(today, &times).await?;
            times
        }
    };

    let hhmm = now.format("%H:%M").to_string();
    info!("sunrise={} sunset={} now={}", times.sunrise, times.sunset, hhmm);
    Ok(times.is_light(&hhmm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(hhmm: &str) -> u32 {
        let (h, m) = hhmm.split_once(':').unwrap();
        h.parse::<u32>().unwrap() * 60 + m.parse::<u32>().unwrap()
    }

    #[test]
    fn london_midsummer() {
        // 21 June, BST
        let sunrise = event(51.5, -0.12, 171.0, 1.0, true);
        let sunset = event(51.5, -0.12, 171.0, 1.0, false);

        assert!((minutes("04:30")..=minutes("05:00")).contains(&minutes(&sunrise)), "{}", sunrise);
        assert!((minutes("21:05")..=minutes("21:40")).contains(&minutes(&sunset)), "{}", sunset);
    }

    #[test]
    fn equator_equinox() {
        let sunrise = event(0.0, 0.0, 79.0, 0.0, true);
        let sunset = event(0.0, 0.0, 79.0, 0.0, false);

        assert!((minutes("05:45")..=minutes("06:15")).contains(&minutes(&sunrise)), "{}", sunrise);
        assert!((minutes("17:55")..=minutes("18:25")).contains(&minutes(&sunset)), "{}", sunset);
    }

    #[test]
    fn polar_night_does_not_produce_nan() {
        let sunrise = event(80.0, 15.0, 355.0, 1.0, true);
        assert_eq!(sunrise.len(), 5);
        assert!(sunrise.chars().all(|c| c.is_ascii_digit() || c == ':'));
    }

    #[test]
    fn light_is_inclusive() {
        let times = SunTimes {
            sunrise: "06:10".to_string(),
            sunset: "20:45".to_string(),
        };
        assert!(times.is_light("06:10"));
        assert!(times.is_light("12:00"));
        assert!(times.is_light("20:45"));
        assert!(!times.is_light("20:46"));
        assert!(!times.is_light("05:59"));
    }

    #[tokio::test]
    async fn without_location_it_is_always_light() -> Result<()> {
        assert!(daylight(None, None, &Local::now()).await?);
        Ok(())
    }
}
