//! Driver for the networked power switches (NPS) that actuate the
//! solenoid valves.
//!
//! The wire protocol is a request/response command exchange addressed to an
//! actor. Command verbs and reply keys are fixed by the hardware
//! configuration: `status <outlet>`, `on <outlet>`, `off <outlet>`,
//! `on --off-after <sec> <outlet>`, `scripts run cycle_with_timeout <id>
//! <sec>` and `scripts stop [<thread_id>]`, with replies carrying
//! `outlet_info {id, state}` and `script {thread_id}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use futures::future::{BoxFuture, join_all};
use serde::Deserialize;

use crate::alerts::AlertSource;
use crate::config::ValveConfig;
use crate::error::FillError;
use crate::retry::Retrier;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct OutletInfo {
    pub id: u32,
    /// `true` when the outlet is currently on (valve open).
    pub state: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScriptInfo {
    pub thread_id: i64,
}

/// Parsed reply from an actor command. Only the keys a given command
/// produces are present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActorReply {
    #[serde(default)]
    pub outlet_info: Option<OutletInfo>,
    #[serde(default)]
    pub script: Option<ScriptInfo>,
    #[serde(default)]
    pub safety_status_labels: Option<Vec<String>>,
}

/// One request/response exchange with an actor. Implementations carry the
/// transport (HTTP gateway in production, in-memory fakes in tests).
pub trait ActorTransport: Send + Sync {
    fn send_command<'a>(
        &'a self,
        actor: &'a str,
        command: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<ActorReply>>;
}

/// Production transport: POSTs the command string to the control gateway
/// and parses the JSON reply.
pub struct HttpActorTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpActorTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl ActorTransport for HttpActorTransport {
    fn send_command<'a>(
        &'a self,
        actor: &'a str,
        command: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<ActorReply>> {
        Box::pin(async move {
            let url = format!("{}/actors/{actor}/command", self.base_url);
            let response = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "command": command }))
                .send()
                .await
                .with_context(|| format!("command '{actor} {command}'"))?;

            if !response.status().is_success() {
                bail!(
                    "command '{actor} {command}' failed with status {}",
                    response.status()
                );
            }

            let reply: ActorReply = response
                .json()
                .await
                .with_context(|| format!("parsing reply to '{actor} {command}'"))?;
            Ok(reply)
        })
    }
}

fn seconds_arg(seconds: f64) -> String {
    // The NPS parses a plain decimal; trim a trailing ".0" for whole seconds.
    if seconds.fract() == 0.0 {
        format!("{}", seconds as i64)
    } else {
        format!("{seconds}")
    }
}

/// The valve-facing driver. Every mutating call is gated on the LN2
/// e-stop state and bounded by retries and timeouts.
pub struct NpsClient {
    transport: Arc<dyn ActorTransport>,
    alerts: Arc<dyn AlertSource>,
    dry_run: bool,
}

impl NpsClient {
    pub fn new(
        transport: Arc<dyn ActorTransport>,
        alerts: Arc<dyn AlertSource>,
        dry_run: bool,
    ) -> Self {
        Self {
            transport,
            alerts,
            dry_run,
        }
    }

    pub fn transport(&self) -> Arc<dyn ActorTransport> {
        Arc::clone(&self.transport)
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    async fn guard_estops(&self) -> Result<(), FillError> {
        match self.alerts.ln2_estops_active().await {
            Ok(true) => Err(FillError::EStopActive),
            Ok(false) => Ok(()),
            // An unreadable e-stop state does not block the command; the
            // safety loop owns that failure budget.
            Err(err) => {
                log::warn!("Could not read e-stop state: {err:#}");
                Ok(())
            }
        }
    }

    /// Retrieves outlet information from the NPS.
    pub async fn outlet_info(&self, actor: &str, outlet: &str) -> Result<OutletInfo, FillError> {
        let retrier = Retrier::new(3, Duration::from_secs(1)).with_timeout(Duration::from_secs(10));
        let command = format!("status {outlet}");

        let reply = retrier
            .run("outlet status", || {
                self.transport.send_command(actor, &command)
            })
            .await
            .map_err(|err| FillError::NpsUnreachable(format!("{err:#}")))?;

        reply
            .outlet_info
            .ok_or_else(|| FillError::NpsUnreachable(format!("'{actor} {command}' returned no outlet_info")))
    }

    /// Turns an outlet on or off.
    ///
    /// With `on=true`, a `timeout` and `use_script=true`, the on-device
    /// `cycle_with_timeout` script is started so the hardware itself closes
    /// the valve after `timeout` seconds; the returned thread id cancels
    /// that timer. With `use_script=false` the `--off-after` form is sent
    /// and the auto-close becomes the NPS's one-shot, not cancellable.
    pub async fn set_outlet(
        &self,
        actor: &str,
        outlet: &str,
        on: bool,
        timeout: Option<f64>,
        use_script: bool,
    ) -> Result<Option<i64>, FillError> {
        self.guard_estops().await?;

        let is_script = on && timeout.is_some() && use_script;
        let command = if is_script {
            let info = self.outlet_info(actor, outlet).await?;
            format!(
                "scripts run cycle_with_timeout {} {}",
                info.id,
                seconds_arg(timeout.unwrap_or_default())
            )
        } else if !on || timeout.is_none() {
            format!("{} {outlet}", if on { "on" } else { "off" })
        } else {
            format!(
                "on --off-after {} {outlet}",
                seconds_arg(timeout.unwrap_or_default())
            )
        };

        if self.dry_run {
            log::debug!("dry run: skipping '{actor} {command}'");
            return Ok(is_script.then(|| rand::random::<u16>() as i64));
        }

        let retrier = Retrier::new(3, Duration::from_secs(1)).with_timeout(Duration::from_secs(30));
        let reply = retrier
            .run("outlet command", || {
                self.transport.send_command(actor, &command)
            })
            .await
            .map_err(|err| FillError::NpsUnreachable(format!("{err:#}")))?;

        if is_script {
            let script = reply.script.ok_or_else(|| {
                FillError::NpsUnreachable(format!("'{actor} {command}' returned no script info"))
            })?;
            return Ok(Some(script.thread_id));
        }

        Ok(None)
    }

    /// Cancels a script thread in an NPS, or all of them when `thread_id`
    /// is `None`.
    pub async fn cancel_scripts(
        &self,
        actor: &str,
        thread_id: Option<i64>,
    ) -> Result<(), FillError> {
        self.guard_estops().await?;

        if self.dry_run {
            return Ok(());
        }

        let command = match thread_id {
            Some(thread_id) => format!("scripts stop {thread_id}"),
            None => "scripts stop".to_string(),
        };

        let retrier = Retrier::new(3, Duration::from_secs(1)).with_timeout(Duration::from_secs(10));
        retrier
            .run("script cancel", || {
                self.transport.send_command(actor, &command)
            })
            .await
            .map_err(|err| FillError::NpsUnreachable(format!("{err:#}")))?;
        Ok(())
    }

    /// Sends `off` to every valve in the descriptor set concurrently.
    /// Per-valve failures are logged and collected; the sweep never stops
    /// early.
    pub async fn close_all(&self, valves: &BTreeMap<String, ValveConfig>) -> anyhow::Result<()> {
        let sweeps = valves.iter().map(|(name, valve)| async move {
            self.set_outlet(&valve.actor, &valve.outlet, false, None, false)
                .await
                .map_err(|err| (name.clone(), err))
        });

        let mut failures = Vec::new();
        for result in join_all(sweeps).await {
            if let Err((name, err)) = result {
                log::error!("Failed closing valve {name:?}: {err}");
                failures.push(name);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to close valves: {}", failures.join(", ")))
        }
    }
}
