//! Observatory alert sources: the O2 alarm and the LN2 emergency stops.
//!
//! Both are polled, never cached. The safety loop reads them every few
//! seconds while valves are open; the NPS driver consults the e-stop state
//! before every mutating command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::nps::ActorTransport;
use crate::retry::Retrier;

/// Label reported in an actor's `safety_status_labels` when an LN2
/// emergency stop has cut power to the valve NPSs.
pub const ESTOP_LN2_LABEL: &str = "E_STOP_LN2";

pub trait AlertSource: Send + Sync {
    /// Whether the O2 alarm is currently asserted.
    fn o2_alert(&self) -> BoxFuture<'_, anyhow::Result<bool>>;

    /// Whether any LN2 e-stop is active.
    fn ln2_estops_active(&self) -> BoxFuture<'_, anyhow::Result<bool>>;
}

#[derive(Debug, Deserialize)]
struct AlertsReply {
    o2_alert: bool,
}

/// Production alert source: O2 state over HTTP, e-stop state from the
/// safety actor's `status` reply.
pub struct HttpAlertSource {
    client: reqwest::Client,
    alerts_url: String,
    transport: Arc<dyn ActorTransport>,
    safety_actor: String,
}

impl HttpAlertSource {
    pub fn new(alerts_url: &str, transport: Arc<dyn ActorTransport>, safety_actor: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            alerts_url: alerts_url.to_string(),
            transport,
            safety_actor: safety_actor.to_string(),
        }
    }
}

impl AlertSource for HttpAlertSource {
    fn o2_alert(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async move {
            let retrier =
                Retrier::new(3, Duration::from_millis(500)).with_timeout(Duration::from_secs(10));

            retrier
                .run("O2 alert read", || async {
                    let response = self
                        .client
                        .get(&self.alerts_url)
                        .send()
                        .await
                        .context("alerts endpoint")?;
                    if !response.status().is_success() {
                        bail!("alerts endpoint returned {}", response.status());
                    }
                    let reply: AlertsReply =
                        response.json().await.context("parsing alerts reply")?;
                    Ok(reply.o2_alert)
                })
                .await
        })
    }

    fn ln2_estops_active(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin(async move {
            let reply = self
                .transport
                .send_command(&self.safety_actor, "status")
                .await
                .context("safety actor status")?;

            let labels = reply.safety_status_labels.unwrap_or_default();
            Ok(labels.iter().any(|label| label == ESTOP_LN2_LABEL))
        })
    }
}
