//! Terminal handler for a run.
//!
//! Drives the phases strictly in order: pre-fill checks, safety loop
//! start, initial close-all sweep, purge, fill, terminal cleanup. Every
//! interruption source (safety loop, operator keystroke, signal, lock
//! release) feeds one abort channel that is raced against the phases; the
//! cleanup phase and the run record happen on every exit path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::alerts::{AlertSource, HttpAlertSource};
use crate::config::{Action, Config, NotificationLevel};
use crate::error::FillError;
use crate::fill::{AbortReason, CheckOptions, EventTimes, FillSequence};
use crate::lock::{self, LockFile};
use crate::notify::Notifier;
use crate::nps::{ActorTransport, HttpActorTransport, NpsClient};
use crate::safety_task::safety_task;
use crate::specs::{CryostatProbe, HttpCryostatProbe};
use crate::thermistor::{ThermistorMonitor, ThermistorReader, UdpThermistorReader};
use crate::tools::{cancel_task, clock_str, now_ms};
use crate::validate::{Validation, load_data, validate_fill};
use crate::valve::ValveTimes;

/// Slack added to a phase's valve ceiling before the outer wait gives up.
const PHASE_TIMEOUT_MARGIN: Duration = Duration::from_secs(60);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(2 * 3600);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// External collaborators of one run. Production transports are built by
/// [`build_drivers`]; tests substitute in-memory fakes.
pub struct Drivers {
    pub nps: Arc<NpsClient>,
    pub reader: Arc<dyn ThermistorReader>,
    pub alerts: Arc<dyn AlertSource>,
    pub probe: Arc<dyn CryostatProbe>,
    pub notifier: Notifier,
}

pub fn build_drivers(config: &Config) -> Drivers {
    let transport: Arc<dyn ActorTransport> =
        Arc::new(HttpActorTransport::new(&config.endpoints.nps_url));
    let alerts: Arc<dyn AlertSource> = Arc::new(HttpAlertSource::new(
        &config.endpoints.alerts_url,
        Arc::clone(&transport),
        &config.endpoints.safety_actor,
    ));
    let nps = Arc::new(NpsClient::new(
        transport,
        Arc::clone(&alerts),
        config.dry_run,
    ));
    let reader: Arc<dyn ThermistorReader> = Arc::new(UdpThermistorReader::new(
        config.thermistors.addr(),
        config.thermistors.channel_map(),
    ));
    let probe: Arc<dyn CryostatProbe> = Arc::new(HttpCryostatProbe::new(&config.endpoints.api_url));
    let notifier = if config.notify {
        Notifier::new(
            config.endpoints.notify_url.clone(),
            config.notification_level,
        )
    } else {
        Notifier::disabled()
    };

    Drivers {
        nps,
        reader,
        alerts,
        probe,
        notifier,
    }
}

/// Persistent record of one run, written as JSON next to the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub action: Action,
    pub cameras: Vec<String>,
    pub event_times: EventTimes,
    pub valves: BTreeMap<String, ValveTimes>,
    pub failed: bool,
    pub aborted: bool,
    pub error: Option<String>,
}

fn spawn_signal_handler(abort_tx: mpsc::Sender<AbortReason>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                log::error!("Failed to install Ctrl+C handler: {err}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    log::error!("Failed to install SIGTERM handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let hangup = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    log::error!("Failed to install SIGHUP handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
            _ = hangup => {}
        }

        #[cfg(not(unix))]
        ctrl_c.await;

        log::error!("Signal received. Aborting and closing all valves.");
        let _ = abort_tx.send(AbortReason::Signal).await;
    })
}

/// Runs a purge/fill action end to end and returns the run record.
/// Only a lock conflict (or an unresolvable valve set) errors out before
/// a record exists; every later failure is folded into the record.
pub async fn run_fill(config: &Config, drivers: &Drivers) -> Result<RunRecord, FillError> {
    if config.clear_lock {
        match lock::clear_lock(&config.lock_path) {
            Ok(true) => log::warn!("Cleared existing lock file before starting."),
            Ok(false) => {}
            Err(err) => log::warn!("Failed clearing the lock file: {err}"),
        }
    }

    let lock = LockFile::acquire(&config.lock_path)?;

    let monitor = ThermistorMonitor::new(Arc::clone(&drivers.reader), Duration::from_secs(1));
    let seq = Arc::new(
        FillSequence::new(config, Arc::clone(&drivers.nps), monitor.clone())
            .map_err(|err| FillError::PreCheckFailed(format!("{err:#}")))?,
    );

    let (abort_tx, mut abort_rx) = mpsc::channel::<AbortReason>(8);
    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(8);

    let mut aux_tasks: Vec<JoinHandle<()>> = Vec::new();
    aux_tasks.push(spawn_signal_handler(abort_tx.clone()));
    aux_tasks.push(lock.spawn_monitor(abort_tx.clone(), shutdown_tx.subscribe()));

    seq.mark_start();
    log::info!(
        "Starting LN2 {} at {}.",
        config.action.as_str(),
        clock_str(now_ms())
    );
    if let Ok(dump) = serde_json::to_string_pretty(config) {
        log::debug!(
            "Running {} with configuration:\n{dump}",
            config.action.as_str()
        );
    }
    drivers
        .notifier
        .post(
            NotificationLevel::Info,
            &format!(
                "Starting LN2 {} at {}.",
                config.action.as_str(),
                clock_str(now_ms())
            ),
            None,
        )
        .await;

    let outcome: Result<(), FillError> = {
        let phases = async {
            // Phase 0: the check gate. Nothing opens before this passes.
            seq.check(
                drivers.alerts.as_ref(),
                drivers.probe.as_ref(),
                CheckOptions {
                    max_pressure: config.max_pressure,
                    max_temperature: config.max_temperature,
                    check_thermistors: config.use_thermistors,
                },
            )
            .await?;

            // Phase 1: the safety loop runs next to everything below.
            aux_tasks.push(tokio::spawn(safety_task(
                Arc::clone(&drivers.alerts),
                abort_tx.clone(),
                shutdown_tx.subscribe(),
            )));

            // Phase 2: sweep to a known starting state.
            log::info!("Closing all valves before {}.", config.action.as_str());
            drivers.nps.close_all(&config.valves).await.map_err(|err| {
                FillError::PreCheckFailed(format!("initial close-all sweep failed: {err:#}"))
            })?;

            if config.use_thermistors {
                monitor.start();
            }

            if config.interactive && !config.no_prompt {
                aux_tasks.push(Arc::clone(&seq).spawn_key_listener(abort_tx.clone()));
            }

            // Phase 3: purge.
            if config.action.includes_purge() {
                let limit =
                    Duration::from_secs_f64(config.purge_ceiling()) + PHASE_TIMEOUT_MARGIN;
                match timeout(limit, seq.purge(config)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(FillError::PhaseTimeout("purge")),
                }
            }

            // Phase 4: fill.
            if config.action.includes_fill() {
                let limit = Duration::from_secs_f64(config.fill_ceiling()) + PHASE_TIMEOUT_MARGIN;
                match timeout(limit, seq.fill(config)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(FillError::PhaseTimeout("fill")),
                }
            }

            Ok(())
        };

        match timeout(OVERALL_TIMEOUT, async {
            tokio::select! {
                result = phases => result,
                Some(reason) = abort_rx.recv() => Err(reason.into_error()),
            }
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FillError::PhaseTimeout("run")),
        }
    };

    if let Err(err) = &outcome {
        log::error!("{err}");
        seq.mark_failed();
        if err.is_abort() {
            seq.abort_all(err.close_valves_on_abort()).await;
        } else {
            // A plain failure mid-run still leaves nothing open.
            seq.close_all_valves().await;
        }
    }

    // Phase 5: terminal cleanup. Runs on every exit path.
    let _ = shutdown_tx.send(());
    monitor.stop();
    match timeout(CLEANUP_TIMEOUT, drivers.nps.close_all(&config.valves)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("Final close-all sweep reported errors: {err:#}"),
        Err(_) => log::error!("Final close-all sweep timed out."),
    }
    seq.mark_end();
    for task in aux_tasks {
        cancel_task(Some(task)).await;
    }

    if config.data_extra_time > 0.0 {
        log::info!(
            "Waiting {} seconds for additional data.",
            config.data_extra_time
        );
        tokio::time::sleep(Duration::from_secs_f64(config.data_extra_time)).await;
    }

    let mut error_text = outcome.as_ref().err().map(ToString::to_string);

    if outcome.is_ok() && let Some(data_path) = &config.data_path {
        if data_path.exists() {
            match load_data(data_path) {
                Ok(rows) => match validate_fill(
                    &seq.event_times(),
                    seq.cameras(),
                    &rows,
                    config.max_temperature_increase,
                ) {
                    Validation::Passed => log::info!("Post-fill validation passed."),
                    Validation::Skipped(reason) => {
                        log::warn!("Post-fill validation skipped: {reason}.");
                    }
                    Validation::Failed(message) => {
                        let err = FillError::ValidationFailed(message);
                        log::error!("{err}");
                        seq.mark_failed();
                        error_text = Some(err.to_string());
                    }
                },
                Err(err) => log::warn!("Could not load post-fill data: {err:#}"),
            }
        } else {
            log::warn!(
                "Data file {} does not exist. Skipping validation.",
                data_path.display()
            );
        }
    }

    let record = RunRecord {
        action: config.action,
        cameras: seq.cameras().to_vec(),
        event_times: seq.event_times(),
        valves: seq.valve_times(),
        failed: seq.failed(),
        aborted: seq.aborted(),
        error: error_text,
    };

    if let Some(path) = &config.record_path {
        match serde_json::to_string_pretty(&record) {
            Ok(json) => {
                if let Err(err) = std::fs::write(path, json) {
                    log::error!("Failed writing run record to {}: {err}", path.display());
                }
            }
            Err(err) => log::error!("Failed serialising the run record: {err}"),
        }
    }

    let record_json = serde_json::to_value(&record).ok();
    if record.failed {
        drivers
            .notifier
            .post(
                NotificationLevel::Error,
                &format!(
                    "LN2 {} failed: {}",
                    config.action.as_str(),
                    record.error.as_deref().unwrap_or("unknown error")
                ),
                record_json.as_ref(),
            )
            .await;
    } else {
        drivers
            .notifier
            .post(
                NotificationLevel::Info,
                &format!("LN2 {} completed successfully.", config.action.as_str()),
                record_json.as_ref(),
            )
            .await;
    }

    lock.release();
    Ok(record)
}

/// Dispatches a CLI action. Returns the process exit code: 0 on success,
/// 1 on any failure, abort or lock conflict.
pub async fn run(config: &Config, drivers: &Drivers) -> i32 {
    match config.action {
        Action::ClearLock => match lock::clear_lock(&config.lock_path) {
            Ok(true) => {
                log::info!("Lock file removed.");
                0
            }
            Ok(false) => {
                log::info!("No lock file to remove.");
                0
            }
            Err(err) => {
                log::error!("Failed removing the lock file: {err}");
                1
            }
        },
        Action::Abort => {
            log::warn!("Closing all valves and releasing the lock.");
            let close_result = drivers.nps.close_all(&config.valves).await;
            if let Err(err) = lock::clear_lock(&config.lock_path) {
                log::error!("Failed removing the lock file: {err}");
            }
            match close_result {
                Ok(()) => 0,
                Err(err) => {
                    log::error!("{err:#}");
                    1
                }
            }
        }
        Action::CloseValves => match drivers.nps.close_all(&config.valves).await {
            Ok(()) => 0,
            Err(err) => {
                log::error!("{err:#}");
                1
            }
        },
        Action::ListProfiles | Action::Serve => {
            // Dispatched by the CLI before a runner is involved.
            log::error!("Action {:?} is not runnable here.", config.action.as_str());
            1
        }
        Action::PurgeAndFill | Action::Purge | Action::Fill | Action::AutoFill => {
            match run_fill(config, drivers).await {
                Ok(record) => {
                    if record.failed || record.aborted {
                        1
                    } else {
                        log::info!(
                            "LN2 {} completed successfully.",
                            config.action.as_str()
                        );
                        0
                    }
                }
                Err(err) => {
                    log::error!("{err}");
                    1
                }
            }
        }
    }
}
