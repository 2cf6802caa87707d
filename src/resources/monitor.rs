use std::time::Duration;

use super::Shared;
use crate::utils::sos::SignalOfStop;

/// Deadline for the monitor thread to notice a stop request.
pub(super) const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Background sampling loop.
///
/// A failed sample never ends the loop: it is logged and retried after the
/// longer retry interval.
pub(super) fn run(shared: &Shared, sos: &SignalOfStop) {
    log::info!("Resource monitor started");

    while !sos.cancelled() {
        let wait = match shared.sample() {
            Ok(()) => shared.config.monitor_interval(),
            Err(e) => {
                log::warn!("Resource monitoring error: {:#}", e);
                shared.config.retry_interval()
            }
        };

        if sos.wait_timeout(wait) {
            break;
        }
    }

    log::info!("Resource monitor stopped");
}
