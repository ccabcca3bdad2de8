use crate::api::AppState;
use crate::presence;
use time::OffsetDateTime;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

/// Periodically flip presence records that stopped heartbeating to
/// offline, so raw table readers agree with the staleness rule.
pub fn run(state: AppState) {
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(state.config.heartbeat_secs));
        loop {
            tick.tick().await;
            let swept = state.pool.get().map_err(crate::error::ChatError::from).and_then(|conn| {
                presence::sweep_stale(&conn, OffsetDateTime::now_utc().unix_timestamp())
            });
            match swept {
                Ok(n) if n > 0 => debug!("marked {n} stale presence records offline"),
                Ok(_) => {}
                Err(e) => warn!("presence sweep failed: {e}"),
            }
        }
    });
}
