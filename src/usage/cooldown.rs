use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Per-(key, model) cooldown: the key is ineligible for the model while
/// `now < until`. Strikes persist across expiries so a key that keeps
/// tripping the same model backs off harder each time, until the daily
/// reset wipes the slate.
#[derive(Debug, Clone, Copy)]
pub struct Cooldown {
    pub until: Instant,
    pub strikes: u32,
}

impl Cooldown {
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.until
    }

    /// Advance strikes and recompute `until = now + base * 2^min(strikes, cap)`.
    pub fn strike(&mut self, now: Instant, added: u32, base: Duration, cap: u32) {
        self.strikes = self.strikes.saturating_add(added);
        let exponent = self.strikes.min(cap);
        self.until = now + base * 2u32.pow(exponent);
    }
}

impl Default for Cooldown {
    fn default() -> Self {
        Self {
            // An expired cooldown; the first strike sets a real horizon.
            until: Instant::now(),
            strikes: 0,
        }
    }
}

/// Usage counters, persisted per key in the snapshot. `usage_today` only
/// accumulates live; the daily rollover folds it into `usage_total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl UsageCounters {
    pub fn add(&mut self, delta: &UsageDelta) {
        self.calls += 1;
        self.prompt_tokens += delta.prompt_tokens;
        self.completion_tokens += delta.completion_tokens;
        self.cost_usd += delta.cost_usd;
    }

    /// Daily rollover: fold another counter set into this one.
    pub fn absorb(&mut self, other: &UsageCounters) {
        self.calls += other.calls;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// What one completed request adds to a key's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageDelta {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strike_doubles_and_caps() {
        let base = Duration::from_secs(30);
        let t0 = Instant::now();
        let mut cd = Cooldown {
            until: t0,
            strikes: 0,
        };

        cd.strike(t0, 1, base, 6);
        assert_eq!(cd.strikes, 1);
        assert_eq!(cd.until - t0, Duration::from_secs(60));

        cd.strike(t0, 1, base, 6);
        assert_eq!(cd.until - t0, Duration::from_secs(120));

        // Past the cap the horizon stops growing: 30s * 2^6.
        for _ in 0..20 {
            cd.strike(t0, 1, base, 6);
        }
        assert_eq!(cd.until - t0, Duration::from_secs(1920));
    }

    #[test]
    fn auth_strikes_advance_twice_as_fast() {
        let base = Duration::from_secs(30);
        let t0 = Instant::now();
        let mut cd = Cooldown {
            until: t0,
            strikes: 0,
        };
        cd.strike(t0, 2, base, 6);
        assert_eq!(cd.strikes, 2);
        assert_eq!(cd.until - t0, Duration::from_secs(120));
    }

    #[test]
    fn counters_roll_over() {
        let mut today = UsageCounters::default();
        today.add(&UsageDelta {
            prompt_tokens: 10,
            completion_tokens: 5,
            cost_usd: 0.01,
        });
        today.add(&UsageDelta {
            prompt_tokens: 1,
            completion_tokens: 1,
            cost_usd: 0.0,
        });
        assert_eq!(today.calls, 2);
        assert_eq!(today.prompt_tokens, 11);

        let mut total = UsageCounters::default();
        total.absorb(&today);
        assert_eq!(total.calls, 2);
        assert_eq!(total.completion_tokens, 6);
    }
}
