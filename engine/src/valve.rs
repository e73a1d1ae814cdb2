//! Per-valve supervision.
//!
//! A supervisor drives one valve through open -> monitor -> close. Opening
//! arms the NPS hardware auto-close script and spawns two watchers: the
//! thermistor watch, which closes the valve once cold liquid has been
//! present long enough, and the max-open watch, which force-closes it when
//! the ceiling is reached. Every terminal path funnels through
//! [`ValveSupervisor::finish`], which fires the `done` signal the opener
//! blocks on; the signal doubles as the cancellation token for both
//! watchers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, sleep};

use crate::config::{ThermistorConfig, ValveConfig};
use crate::error::FillError;
use crate::nps::NpsClient;
use crate::thermistor::ThermistorMonitor;
use crate::tools::now_ms;

/// Per-run timestamps for one valve, frozen once `done` fires.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValveTimes {
    pub open_time_ms: Option<i64>,
    pub close_time_ms: Option<i64>,
    pub first_active_ms: Option<i64>,
    pub timed_out: bool,
}

#[derive(Default)]
struct ValveState {
    /// Hardware auto-close script armed for this valve, if any. Arming a
    /// new one cancels the previous.
    thread_id: Option<i64>,
    /// Set on entry to `open()`, before the NPS ack. A valve that was
    /// commanded on but not yet acked counts as active for finish/abort.
    opening: bool,
    /// True between open ack and close.
    active: bool,
    /// The off-command path has been taken; further closes are no-ops.
    hw_closed: bool,
    /// Failure from a watcher-initiated close, surfaced by `open()`.
    close_error: Option<String>,
    times: ValveTimes,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub min_open_time: f64,
    pub max_open_time: f64,
    pub use_thermistor: bool,
    /// Close as soon as the thermistor criterion is met. With a thermistor
    /// barrier across valves this is false and the orchestrator closes the
    /// group once every watcher has reported.
    pub close_on_active: bool,
}

pub struct ValveSupervisor {
    name: String,
    actor: String,
    outlet: String,
    thermistor: Option<ThermistorConfig>,
    nps: Arc<NpsClient>,
    monitor: ThermistorMonitor,
    state: Mutex<ValveState>,
    done_tx: watch::Sender<bool>,
}

async fn wait_done(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl ValveSupervisor {
    pub fn new(
        name: &str,
        valve: &ValveConfig,
        nps: Arc<NpsClient>,
        monitor: ThermistorMonitor,
    ) -> Self {
        Self {
            name: name.to_string(),
            actor: valve.actor.clone(),
            outlet: valve.outlet.clone(),
            thermistor: valve.thermistor.clone(),
            nps,
            monitor,
            state: Mutex::new(ValveState::default()),
            done_tx: watch::Sender::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn times(&self) -> ValveTimes {
        self.state.lock().unwrap().times
    }

    /// Channel this valve's thermistor reports on, unless it is disabled
    /// or not configured.
    pub fn thermistor_channel(&self) -> Option<&str> {
        match &self.thermistor {
            Some(thermistor) if !thermistor.disabled => {
                Some(thermistor.channel.as_deref().unwrap_or(&self.outlet))
            }
            _ => None,
        }
    }

    /// Whether the valve should be treated as open for finish/abort.
    pub fn engaged(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.opening || st.active
    }

    fn done_rx(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    fn record_first_active(&self) {
        let mut st = self.state.lock().unwrap();
        st.times.first_active_ms.get_or_insert(now_ms());
    }

    /// Pre-fill connectivity check: the outlet must answer and must not
    /// already be on.
    pub async fn check(&self) -> Result<(), FillError> {
        let info = self
            .nps
            .outlet_info(&self.actor, &self.outlet)
            .await
            .map_err(|err| {
                FillError::PreCheckFailed(format!("valve {:?}: {err}", self.name))
            })?;

        if info.state {
            return Err(FillError::PreCheckFailed(format!(
                "valve {:?} is already open",
                self.name
            )));
        }

        Ok(())
    }

    /// Opens the valve and blocks until `done` fires.
    pub async fn open(self: Arc<Self>, opts: OpenOptions) -> Result<(), FillError> {
        self.state.lock().unwrap().opening = true;

        if let Err(err) = self
            .set_state(true, Some(opts.max_open_time), true, false)
            .await
        {
            self.state.lock().unwrap().opening = false;
            return Err(err);
        }

        if opts.use_thermistor && let Some(thermistor) = self.thermistor.clone() {
            if thermistor.disabled {
                log::warn!(
                    "The thermistor for valve {:?} is disabled. Will not monitor it.",
                    self.name
                );
            } else {
                let sup = Arc::clone(&self);
                let min_open_time = opts.min_open_time;
                let close_on_active = opts.close_on_active;
                tokio::spawn(async move {
                    thermistor_watch(sup, thermistor, min_open_time, close_on_active).await;
                });
            }
        }

        let sup = Arc::clone(&self);
        let max_open = Duration::from_secs_f64(opts.max_open_time);
        tokio::spawn(async move {
            let mut done_rx = sup.done_rx();
            tokio::select! {
                _ = sleep(max_open) => {
                    if let Err(err) = sup.finish(true, true).await {
                        log::error!(
                            "Error closing valve {:?} after timeout: {err}",
                            sup.name
                        );
                    }
                }
                _ = wait_done(&mut done_rx) => {}
            }
        });

        let mut done_rx = self.done_rx();
        wait_done(&mut done_rx).await;

        let close_error = self.state.lock().unwrap().close_error.take();
        match close_error {
            Some(detail) => Err(FillError::NpsUnreachable(detail)),
            None => Ok(()),
        }
    }

    /// Ends supervision of the valve. With `close_valve`, cancels the
    /// armed hardware timer and sends the off command; the first such call
    /// wins and later ones are no-ops. Always fires `done`, even when the
    /// off command fails.
    pub async fn finish(&self, close_valve: bool, timed_out: bool) -> Result<(), FillError> {
        let result = if close_valve {
            let already_closed = {
                let mut st = self.state.lock().unwrap();
                let already = st.hw_closed;
                st.hw_closed = true;
                already
            };

            if already_closed {
                Ok(())
            } else {
                let result = self.set_state(false, None, false, timed_out).await;
                if let Err(err) = &result {
                    let mut st = self.state.lock().unwrap();
                    st.close_error = Some(err.to_string());
                }
                result
            }
        } else {
            Ok(())
        };

        {
            let mut st = self.state.lock().unwrap();
            st.opening = false;
            st.active = false;
        }
        let _ = self.done_tx.send(true);

        result
    }

    /// Ends supervision recording the valve as closed without commanding
    /// it. Used when an e-stop has already cut power to the NPS: the
    /// solenoid is de-energised, and commands could not reach it anyway.
    pub fn finish_unpowered(&self) {
        {
            let mut st = self.state.lock().unwrap();
            if st.times.open_time_ms.is_some() {
                st.times.close_time_ms.get_or_insert(now_ms());
            }
            st.opening = false;
            st.active = false;
            st.hw_closed = true;
        }
        let _ = self.done_tx.send(true);
    }

    async fn set_state(
        &self,
        on: bool,
        timeout: Option<f64>,
        use_script: bool,
        did_timeout: bool,
    ) -> Result<(), FillError> {
        // At most one auto-close script per valve: disarm the previous one
        // before commanding the outlet.
        let thread_id = self.state.lock().unwrap().thread_id.take();
        if let Some(thread_id) = thread_id
            && let Err(err) = self.nps.cancel_scripts(&self.actor, Some(thread_id)).await
        {
            log::warn!(
                "Failed cancelling NPS script {thread_id} for valve {:?}: {err}",
                self.name
            );
        }

        let result = self
            .nps
            .set_outlet(&self.actor, &self.outlet, on, timeout, use_script)
            .await;

        match result {
            Ok(new_thread) => {
                {
                    let mut st = self.state.lock().unwrap();
                    if on {
                        st.thread_id = new_thread;
                        st.times.open_time_ms.get_or_insert(now_ms());
                        st.active = true;
                    } else {
                        st.times.close_time_ms.get_or_insert(now_ms());
                        if did_timeout {
                            st.times.timed_out = true;
                        }
                        st.active = false;
                    }
                }

                if on {
                    match new_thread {
                        Some(thread_id) => log::info!(
                            "Valve {:?} was opened with timeout={} (thread_id={thread_id}).",
                            self.name,
                            timeout.unwrap_or_default()
                        ),
                        None => log::info!("Valve {:?} was opened.", self.name),
                    }
                } else if did_timeout {
                    log::warn!("Valve {:?} was closed due to timeout.", self.name);
                } else {
                    log::info!("Valve {:?} was closed.", self.name);
                }

                Ok(())
            }
            Err(err) => {
                if !on {
                    // Record when the close was attempted even if the
                    // command failed; the close-all sweep retries it.
                    let mut st = self.state.lock().unwrap();
                    st.times.close_time_ms.get_or_insert(now_ms());
                    if did_timeout {
                        st.times.timed_out = true;
                    }
                    st.active = false;
                }
                Err(err)
            }
        }
    }
}

/// Watches the shared thermistor samples for one valve and finishes the
/// fill once the channel has been continuously active for
/// `required_active_time` and the valve has been open at least
/// `min_open_time`.
async fn thermistor_watch(
    sup: Arc<ValveSupervisor>,
    thermistor: ThermistorConfig,
    min_open_time: f64,
    close_on_active: bool,
) {
    let channel = thermistor
        .channel
        .clone()
        .unwrap_or_else(|| sup.outlet.clone());
    let interval = Duration::from_secs_f64(thermistor.monitoring_interval);
    let required = thermistor.required_active_time;
    let stale_after = thermistor.monitoring_interval * 10.0;

    let start = Instant::now();
    let mut done_rx = sup.done_rx();
    let mut last_seen_seq: Option<u64> = None;
    let mut last_seen_at: Option<Instant> = None;
    let mut active_since: Option<Instant> = None;
    let mut first_active_recorded = false;
    let mut stale_warned_at: Option<Instant> = None;

    log::debug!("Started to monitor thermistor {channel:?}.");

    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = wait_done(&mut done_rx) => return,
        }

        let elapsed = start.elapsed().as_secs_f64();

        if let Some(sample) = sup.monitor.latest()
            && let Some(&value) = sample.channels.get(&channel)
            && last_seen_seq != Some(sample.seq)
        {
            last_seen_seq = Some(sample.seq);
            last_seen_at = Some(Instant::now());

            if value {
                if active_since.is_none() {
                    active_since = Some(Instant::now());
                    if elapsed >= min_open_time {
                        log::info!(
                            "Thermistor {channel:?} is active. Waiting {required} \
                             seconds before closing the valve."
                        );
                    } else {
                        log::warn!(
                            "Thermistor {channel:?} is active but the minimum open \
                             time has not been reached."
                        );
                    }
                }

                let active_for = active_since
                    .map(|since| since.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                if active_for >= required {
                    if !first_active_recorded {
                        first_active_recorded = true;
                        sup.record_first_active();
                    }
                    if elapsed >= min_open_time {
                        break;
                    }
                }
            } else {
                if active_since.is_some() {
                    log::warn!(
                        "Thermistor {channel:?} is no longer active. Resetting counters."
                    );
                }
                active_since = None;
            }
        }

        // Stale data is a warning, never a failure: the max-open watcher
        // still bounds the fill.
        let stale = match last_seen_at {
            Some(seen) => seen.elapsed().as_secs_f64() > stale_after,
            None => elapsed > stale_after,
        };
        if stale {
            let due = stale_warned_at
                .map(|at| at.elapsed().as_secs_f64() > 30.0)
                .unwrap_or(true);
            if due {
                log::warn!("No fresh data from thermistor {channel:?}.");
                stale_warned_at = Some(Instant::now());
            }
        }
    }

    if close_on_active {
        log::debug!(
            "Closing valve {:?} due to thermistor feedback.",
            sup.name()
        );
    } else {
        log::warn!(
            "Thermistor {channel:?} is active. Finishing valve {:?} without closing it.",
            sup.name()
        );
    }

    if let Err(err) = sup.finish(close_on_active, false).await {
        log::error!(
            "Error closing valve {:?} on thermistor feedback: {err}",
            sup.name()
        );
    }
}
