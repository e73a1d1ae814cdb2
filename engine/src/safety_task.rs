//! Safety loop that runs next to the purge/fill phases.
//!
//! Every cycle it polls the O2 alarm and the LN2 e-stop state. An O2
//! alarm aborts the run and closes every valve; an e-stop aborts without
//! closing anything, since the valve NPSs have already lost power. Up to
//! [`MAX_O2_READ_FAILURES`] consecutive O2 read failures are tolerated
//! before they themselves trigger an abort; e-stop read errors are logged
//! but never counted.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, sleep};

use crate::alerts::AlertSource;
use crate::fill::AbortReason;

const SAFETY_INTERVAL: Duration = Duration::from_secs(3);
const MAX_O2_READ_FAILURES: u32 = 10;

pub async fn safety_task(
    alerts: Arc<dyn AlertSource>,
    abort_tx: mpsc::Sender<AbortReason>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut o2_read_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = sleep(SAFETY_INTERVAL) => {}
            recv = shutdown_rx.recv() => {
                match recv {
                    Ok(_)
                    | Err(broadcast::error::RecvError::Lagged(_))
                    | Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }

        match alerts.o2_alert().await {
            Ok(true) => {
                log::error!("Safety: O2 alarm is active. Aborting and closing valves.");
                let _ = abort_tx.send(AbortReason::O2Alarm).await;
                break;
            }
            Ok(false) => {
                o2_read_failures = 0;
            }
            Err(err) => {
                o2_read_failures += 1;
                log::warn!(
                    "Safety: failed reading the O2 alert state \
                     ({o2_read_failures}/{MAX_O2_READ_FAILURES}): {err:#}"
                );
                if o2_read_failures >= MAX_O2_READ_FAILURES {
                    log::error!("Safety: too many O2 read failures. Aborting.");
                    let _ = abort_tx.send(AbortReason::AlertReadFailures).await;
                    break;
                }
            }
        }

        match alerts.ln2_estops_active().await {
            Ok(true) => {
                log::error!(
                    "Safety: an LN2 e-stop is active. Aborting without closing valves."
                );
                let _ = abort_tx.send(AbortReason::EStop).await;
                break;
            }
            Ok(false) => {}
            Err(err) => {
                log::warn!("Safety: failed reading the e-stop state: {err:#}");
            }
        }
    }
}
