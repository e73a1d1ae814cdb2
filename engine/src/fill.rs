//! The fill sequence: one purge/fill run over a camera set.
//!
//! A [`FillSequence`] owns one supervisor per valve (the cameras plus the
//! shared purge valve), the event-time record, and the failed/aborted
//! flags. The runner drives it through the phases; the safety loop, the
//! operator key listener and the signal handler all feed the same abort
//! channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alerts::AlertSource;
use crate::config::Config;
use crate::error::{FillError, Trip};
use crate::nps::NpsClient;
use crate::specs::CryostatProbe;
use crate::thermistor::ThermistorMonitor;
use crate::tools::now_ms;
use crate::valve::{OpenOptions, ValveSupervisor, ValveTimes};

/// Why a run is being aborted. Everything that can interrupt a run feeds
/// one channel of these; the runner maps them to errors and decides
/// whether valves get closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    O2Alarm,
    EStop,
    AlertReadFailures,
    Operator,
    Signal,
    /// The lockfile disappeared mid-run (external force-release).
    LockReleased,
}

impl AbortReason {
    /// All aborts close the valves except an e-stop, where the NPSs have
    /// already lost power.
    pub fn close_valves(self) -> bool {
        self != Self::EStop
    }

    pub fn into_error(self) -> FillError {
        match self {
            Self::O2Alarm => FillError::SafetyTripped(Trip::O2Alarm),
            Self::EStop => FillError::SafetyTripped(Trip::EStop),
            Self::AlertReadFailures => FillError::SafetyTripped(Trip::AlertReadFailures),
            Self::Operator | Self::Signal | Self::LockReleased => FillError::OperatorAbort,
        }
    }
}

fn set_once(slot: &mut Option<i64>) {
    if slot.is_none() {
        *slot = Some(now_ms());
    }
}

/// Event times for one run. Writes are monotone: a field is set once and
/// never cleared.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventTimes {
    pub start_ms: Option<i64>,
    pub purge_start_ms: Option<i64>,
    pub purge_complete_ms: Option<i64>,
    pub fill_start_ms: Option<i64>,
    pub fill_complete_ms: Option<i64>,
    pub fail_time_ms: Option<i64>,
    pub abort_time_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct CheckOptions {
    pub max_pressure: Option<f64>,
    pub max_temperature: Option<f64>,
    pub check_thermistors: bool,
}

pub struct FillSequence {
    cameras: Vec<String>,
    purge_valve: String,
    valves: BTreeMap<String, Arc<ValveSupervisor>>,
    monitor: ThermistorMonitor,
    event_times: Mutex<EventTimes>,
    failed: AtomicBool,
    aborted: AtomicBool,
}

impl FillSequence {
    pub fn new(
        config: &Config,
        nps: Arc<NpsClient>,
        monitor: ThermistorMonitor,
    ) -> anyhow::Result<Self> {
        let mut valves = BTreeMap::new();
        for name in config.cameras.iter().chain([&config.purge_valve]) {
            let valve = config.valve(name)?;
            valves.insert(
                name.clone(),
                Arc::new(ValveSupervisor::new(
                    name,
                    valve,
                    Arc::clone(&nps),
                    monitor.clone(),
                )),
            );
        }

        Ok(Self {
            cameras: config.cameras.clone(),
            purge_valve: config.purge_valve.clone(),
            valves,
            monitor,
            event_times: Mutex::new(EventTimes::default()),
            failed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        })
    }

    pub fn cameras(&self) -> &[String] {
        &self.cameras
    }

    pub fn supervisor(&self, name: &str) -> Option<&Arc<ValveSupervisor>> {
        self.valves.get(name)
    }

    pub fn event_times(&self) -> EventTimes {
        *self.event_times.lock().unwrap()
    }

    pub fn valve_times(&self) -> BTreeMap<String, ValveTimes> {
        self.valves
            .iter()
            .map(|(name, sup)| (name.clone(), sup.times()))
            .collect()
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn mark_start(&self) {
        set_once(&mut self.event_times.lock().unwrap().start_ms);
    }

    pub fn mark_end(&self) {
        set_once(&mut self.event_times.lock().unwrap().end_ms);
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        set_once(&mut self.event_times.lock().unwrap().fail_time_ms);
    }

    fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        set_once(&mut self.event_times.lock().unwrap().abort_time_ms);
    }

    /// Pre-fill check gate. Any failure marks the run failed and returns
    /// before a single valve has been opened.
    pub async fn check(
        &self,
        alerts: &dyn AlertSource,
        probe: &dyn CryostatProbe,
        opts: CheckOptions,
    ) -> Result<(), FillError> {
        let result = self.run_checks(alerts, probe, opts).await;
        if result.is_err() {
            self.mark_failed();
        }
        result
    }

    async fn run_checks(
        &self,
        alerts: &dyn AlertSource,
        probe: &dyn CryostatProbe,
        opts: CheckOptions,
    ) -> Result<(), FillError> {
        match alerts.o2_alert().await {
            Ok(false) => {}
            Ok(true) => {
                return Err(FillError::PreCheckFailed("the O2 alarm is active".into()));
            }
            Err(err) => {
                return Err(FillError::PreCheckFailed(format!(
                    "failed reading the O2 alert state: {err:#}"
                )));
            }
        }

        match alerts.ln2_estops_active().await {
            Ok(false) => {}
            Ok(true) => {
                return Err(FillError::PreCheckFailed(
                    "an LN2 e-stop is active".into(),
                ));
            }
            Err(err) => {
                return Err(FillError::PreCheckFailed(format!(
                    "failed reading the e-stop state: {err:#}"
                )));
            }
        }

        if let Some(max_temperature) = opts.max_temperature {
            log::info!("Checking LN2 temperatures ...");
            let temperatures = probe.temperatures(&self.cameras).await.map_err(|err| {
                FillError::PreCheckFailed(format!("failed reading temperatures: {err:#}"))
            })?;
            for camera in &self.cameras {
                let Some(&temperature) = temperatures.get(camera) else {
                    return Err(FillError::PreCheckFailed(format!(
                        "failed retrieving {camera:?} temperature"
                    )));
                };
                if temperature > max_temperature {
                    return Err(FillError::PreCheckFailed(format!(
                        "LN2 temperature for camera {camera} is {temperature:.1} C, \
                         above the maximum allowed ({max_temperature:.1} C)"
                    )));
                }
            }
        }

        if let Some(max_pressure) = opts.max_pressure {
            log::info!("Checking pressures ...");
            let pressures = probe.pressures(&self.cameras).await.map_err(|err| {
                FillError::PreCheckFailed(format!("failed reading pressures: {err:#}"))
            })?;
            for camera in &self.cameras {
                let Some(&pressure) = pressures.get(camera) else {
                    return Err(FillError::PreCheckFailed(format!(
                        "failed retrieving {camera:?} pressure"
                    )));
                };
                if pressure > max_pressure {
                    return Err(FillError::PreCheckFailed(format!(
                        "pressure for camera {camera} is {pressure} Torr, above the \
                         maximum allowed ({max_pressure} Torr)"
                    )));
                }
            }
        }

        log::info!("Checking valve outlets ...");
        for sup in self.valves.values() {
            sup.check().await?;
        }

        if opts.check_thermistors {
            log::info!("Checking thermistors ...");
            let channels = self.monitor.read_now().await.map_err(|err| {
                FillError::PreCheckFailed(format!("failed reading thermistors: {err:#}"))
            })?;

            for (name, sup) in &self.valves {
                let Some(channel) = sup.thermistor_channel() else {
                    continue;
                };
                match channels.get(channel).copied() {
                    Some(false) => {}
                    Some(true) => {
                        return Err(FillError::PreCheckFailed(format!(
                            "the thermistor for valve {name} is active"
                        )));
                    }
                    None => {
                        return Err(FillError::PreCheckFailed(format!(
                            "thermistor channel {channel:?} for valve {name} is not \
                             reported by the server"
                        )));
                    }
                }
            }
        }

        log::info!("All pre-fill checks passed.");
        Ok(())
    }

    /// Phase 3: purge the gas line through the shared purge valve.
    pub async fn purge(&self, config: &Config) -> Result<(), FillError> {
        let sup = self
            .valves
            .get(&self.purge_valve)
            .expect("purge valve always has a supervisor");

        set_once(&mut self.event_times.lock().unwrap().purge_start_ms);
        log::info!(
            "Beginning purge using valve {:?} with use_thermistor={}, \
             min_open_time={}, timeout={}.",
            self.purge_valve,
            config.use_thermistors,
            config.min_purge_time,
            config.purge_ceiling()
        );

        let result = Arc::clone(sup)
            .open(OpenOptions {
                min_open_time: config.min_purge_time,
                max_open_time: config.purge_ceiling(),
                use_thermistor: config.use_thermistors,
                close_on_active: true,
            })
            .await;

        match result {
            Ok(()) => {
                log::info!("Purge complete.");
                set_once(&mut self.event_times.lock().unwrap().purge_complete_ms);
                Ok(())
            }
            Err(err) => {
                self.mark_failed();
                Err(err)
            }
        }
    }

    /// Phase 4: fill every camera concurrently.
    pub async fn fill(&self, config: &Config) -> Result<(), FillError> {
        set_once(&mut self.event_times.lock().unwrap().fill_start_ms);
        log::info!(
            "Beginning fill on cameras {:?} with use_thermistors={}, \
             min_open_time={}, timeout={}.",
            self.cameras,
            config.use_thermistors,
            config.min_fill_time,
            config.fill_ceiling()
        );

        let opts = OpenOptions {
            min_open_time: config.min_fill_time,
            max_open_time: config.fill_ceiling(),
            use_thermistor: config.use_thermistors,
            // With the thermistor barrier the watchers only report; the
            // group is closed below once every camera has reported.
            close_on_active: !config.require_all_thermistors,
        };

        let opens = self.cameras.iter().map(|camera| {
            let sup = Arc::clone(&self.valves[camera]);
            async move { sup.open(opts).await }
        });

        let first_error = join_all(opens)
            .await
            .into_iter()
            .find_map(Result::err);
        if let Some(err) = first_error {
            self.mark_failed();
            return Err(err);
        }

        if config.require_all_thermistors {
            log::info!("All thermistors have reported. Closing the fill valves.");
            let closes = self.cameras.iter().map(|camera| {
                let sup = Arc::clone(&self.valves[camera]);
                async move { sup.finish(true, false).await }
            });
            let first_error = join_all(closes)
                .await
                .into_iter()
                .find_map(Result::err);
            if let Some(err) = first_error {
                self.mark_failed();
                return Err(err);
            }
        }

        log::info!("Fill complete.");
        set_once(&mut self.event_times.lock().unwrap().fill_complete_ms);
        Ok(())
    }

    /// Operator finish: close only the valves that are currently engaged
    /// (including ones commanded on but not yet acked) and let the run
    /// complete normally.
    pub async fn finish_active(&self) {
        let engaged: Vec<_> = self
            .valves
            .values()
            .filter(|sup| sup.engaged())
            .map(Arc::clone)
            .collect();

        if engaged.is_empty() {
            return;
        }

        log::warn!("Finishing: closing {} active valve(s).", engaged.len());
        let closes = engaged.iter().map(|sup| sup.finish(true, false));
        for (sup, result) in engaged.iter().zip(join_all(closes).await) {
            if let Err(err) = result {
                log::error!("Error closing valve {:?}: {err}", sup.name());
            }
        }
    }

    /// Closes every valve in the descriptor set, opened or not, and ends
    /// supervision. Per-valve failures are logged; the sweep never stops
    /// early.
    pub async fn close_all_valves(&self) {
        let finishes = self.valves.values().map(|sup| sup.finish(true, false));
        for (sup, result) in self.valves.values().zip(join_all(finishes).await) {
            if let Err(err) = result {
                log::error!("Error closing valve {:?}: {err}", sup.name());
            }
        }
    }

    /// Ends supervision of every valve without commanding the hardware.
    /// The NPSs are unpowered, so open valves are recorded as closed.
    fn release_all(&self) {
        for sup in self.valves.values() {
            sup.finish_unpowered();
        }
    }

    /// Aborts the run. With `close_valves`, every valve in the descriptor
    /// set receives an off command, opened or not; without it (e-stop) the
    /// supervisors are only released.
    pub async fn abort_all(&self, close_valves: bool) {
        self.mark_aborted();
        if close_valves {
            self.close_all_valves().await;
        } else {
            self.release_all();
        }
    }

    /// Interactive keystroke listener on stdin: enter finishes the
    /// current phase, `x` aborts the run.
    pub fn spawn_key_listener(
        self: Arc<Self>,
        abort_tx: mpsc::Sender<AbortReason>,
    ) -> JoinHandle<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.spawn_key_listener_on(stdin, abort_tx)
    }

    /// Listener core, generic over the input stream so tests can feed it
    /// keystrokes directly.
    pub fn spawn_key_listener_on<R>(
        self: Arc<Self>,
        input: R,
        abort_tx: mpsc::Sender<AbortReason>,
    ) -> JoinHandle<()>
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        let seq = self;
        tokio::spawn(async move {
            log::warn!("Press \"x\" to abort or \"enter\" to finish the current phase.");
            let mut lines = input.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                match line.trim() {
                    "" => {
                        log::warn!("Finish requested from the console.");
                        seq.finish_active().await;
                    }
                    "x" | "X" => {
                        log::warn!("Aborting purge/fill.");
                        let _ = abort_tx.send(AbortReason::Operator).await;
                        return;
                    }
                    _ => {}
                }
            }
        })
    }
}
