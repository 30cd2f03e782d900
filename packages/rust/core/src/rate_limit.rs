//! In-memory hourly quotas per caller and action.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use postforge_shared::{PostforgeError, RateLimitConfig, Result};
use tracing::warn;

const WINDOW: Duration = Duration::from_secs(3600);

/// Quota-bearing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Generate,
    Save,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Save => "save",
        }
    }
}

/// One keyed limiter per action. `None` means a zero quota, which rejects
/// every call.
pub struct RateLimiter {
    generate: Option<DefaultKeyedRateLimiter<String>>,
    save: Option<DefaultKeyedRateLimiter<String>>,
    window: Duration,
    clock: DefaultClock,
}

fn keyed(per_window: u32, window: Duration) -> Option<DefaultKeyedRateLimiter<String>> {
    let burst = NonZeroU32::new(per_window)?;
    let quota = Quota::with_period(window / per_window)
        .unwrap_or_else(|| Quota::per_hour(burst))
        .allow_burst(burst);
    Some(DefaultKeyedRateLimiter::keyed(quota))
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_window(config, WINDOW)
    }

    /// Same quotas spread over `window` instead of an hour.
    pub fn with_window(config: &RateLimitConfig, window: Duration) -> Self {
        Self {
            generate: keyed(config.generate_per_hour, window),
            save: keyed(config.save_per_hour, window),
            window,
            clock: DefaultClock::default(),
        }
    }

    /// Take one cell for `caller`, or fail with `RateLimited` when the
    /// quota is spent.
    pub fn check(&self, caller: &str, action: Action) -> Result<()> {
        let limiter = match action {
            Action::Generate => self.generate.as_ref(),
            Action::Save => self.save.as_ref(),
        };

        let retry_after = match limiter {
            None => self.window,
            Some(limiter) => match limiter.check_key(&caller.to_string()) {
                Ok(()) => return Ok(()),
                Err(not_until) => not_until.wait_time_from(self.clock.now()),
            },
        };

        // Rounded up to whole seconds.
        let retry_after_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        warn!(caller, action = action.as_str(), retry_after_secs, "rate limit hit");
        Err(PostforgeError::RateLimited {
            action: action.as_str().to_string(),
            retry_after_secs,
        })
    }
}
