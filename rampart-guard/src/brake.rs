//! Fleet-wide overload brake.
//!
//! One counter per minute shared by every client. Once it passes the
//! configured maximum, every request is refused until the minute rolls over,
//! regardless of the per-client budgets.

use std::sync::Arc;
use std::time::Duration;

use rampart_core::{elapsed_between, Clock, RampartError, RampartResult};
use rampart_storage::SharedStore;
use tracing::{error, warn};

const BRAKE_KEY: &str = "rate:global";
const BRAKE_WINDOW: Duration = Duration::from_secs(60);

/// Global requests-per-minute ceiling.
#[derive(Clone)]
pub struct OverloadBrake {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    max_per_minute: u32,
}

impl OverloadBrake {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, max_per_minute: u32) -> Self {
        Self {
            store,
            clock,
            max_per_minute,
        }
    }

    /// Count this request and refuse it if the fleet is over budget.
    pub async fn check(&self) -> RampartResult<()> {
        let counter = match self.store.incr_with_expiry(BRAKE_KEY, BRAKE_WINDOW).await {
            Ok(counter) => counter,
            Err(e) => {
                warn!(error = %e, "Overload brake store unavailable, admitting request");
                return Ok(());
            }
        };

        if counter.value > u64::from(self.max_per_minute) {
            if counter.value == u64::from(self.max_per_minute) + 1 {
                error!(
                    max_per_minute = self.max_per_minute,
                    "Overload brake engaged, refusing all requests"
                );
            }
            return Err(RampartError::RateLimitExceeded {
                scope: "global".to_string(),
                limit: self.max_per_minute,
                retry_after: elapsed_between(self.clock.now(), counter.expires_at),
            });
        }
        Ok(())
    }
}
