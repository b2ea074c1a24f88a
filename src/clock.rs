use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, TimeDelta};

/// Time capability injected into the engine.
///
/// `now()` is monotonic and drives deadlines, cooldowns and lockouts;
/// `local_now()` is wall-calendar time and drives only the daily reset and
/// until-midnight cooldowns. Keeping the two apart means a wall-clock jump
/// can never shorten a deadline.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn local_now(&self) -> DateTime<Local>;

    async fn sleep_until(&self, deadline: Instant);

    fn local_date(&self) -> NaiveDate {
        self.local_now().date_naive()
    }
}

/// Production clock: tokio timers over the tokio instant source, so tests
/// running under `start_paused` see deadlines advance with virtual time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn local_now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

/// Duration from `local_now` until the next local midnight.
///
/// Falls back to 24h on the (DST-degenerate) days where the successor
/// midnight cannot be represented.
pub fn until_local_midnight(local_now: DateTime<Local>) -> Duration {
    let next_day = local_now.date_naive() + TimeDelta::days(1);
    let Some(midnight) = next_day
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
    else {
        return Duration::from_secs(24 * 60 * 60);
    };
    (midnight - local_now)
        .to_std()
        .unwrap_or(Duration::from_secs(24 * 60 * 60))
}
