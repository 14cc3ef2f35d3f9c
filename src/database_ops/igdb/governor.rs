use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Coarse fixed-window limiter shared by every upstream request.
///
/// Each `acquire()` bumps a counter; once it reaches `ceiling` the caller sleeps for `cooldown`
/// and the counter starts over. The counter lives behind an async mutex held across the sleep,
/// so concurrent callers queue behind the cooldown instead of slipping past it.
#[derive(Debug)]
pub struct RateGovernor {
    ceiling: u32,
    cooldown: Duration,
    issued: Mutex<u32>,
}

impl RateGovernor {
    pub fn new(ceiling: u32, cooldown: Duration) -> Self {
        Self {
            ceiling,
            cooldown,
            issued: Mutex::new(0),
        }
    }

    /// A governor that never waits.
    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub async fn acquire(&self) {
        if self.ceiling == 0 {
            return;
        }
        let mut issued = self.issued.lock().await;
        *issued += 1;
        if *issued >= self.ceiling {
            debug!(
                target = "igdb",
                ceiling = self.ceiling,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "request ceiling reached; cooling down"
            );
            tokio::time::sleep(self.cooldown).await;
            *issued = 0;
        }
    }

    /// Requests issued in the current window.
    pub async fn issued(&self) -> u32 {
        *self.issued.lock().await
    }
}
