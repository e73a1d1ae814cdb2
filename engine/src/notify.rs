//! Operator notifications.
//!
//! The engine reports run outcomes by POSTing small JSON payloads to a
//! configured webhook. Formatting and routing (Slack blocks, email
//! templates) live behind that webhook; the engine only decides *when* to
//! notify and with what text. Notifications are only emitted from the
//! terminal handler, never from inside supervisors.

use serde::Serialize;

use crate::config::NotificationLevel;
use crate::tools::now_ms;

#[derive(Debug, Serialize)]
struct NotificationPayload<'a> {
    timestamp_ms: i64,
    level: NotificationLevel,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<&'a serde_json::Value>,
}

pub struct Notifier {
    client: reqwest::Client,
    url: Option<String>,
    disabled: bool,
    level: NotificationLevel,
}

impl Notifier {
    pub fn new(url: Option<String>, level: NotificationLevel) -> Self {
        let disabled = url.is_none();
        Self {
            client: reqwest::Client::new(),
            url,
            disabled,
            level,
        }
    }

    /// A notifier that drops everything.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            url: None,
            disabled: true,
            level: NotificationLevel::Error,
        }
    }

    fn should_send(&self, level: NotificationLevel) -> bool {
        if self.disabled {
            return false;
        }
        match self.level {
            NotificationLevel::Info => true,
            NotificationLevel::Error => level == NotificationLevel::Error,
        }
    }

    /// Posts a notification; delivery failures are logged, never raised.
    pub async fn post(
        &self,
        level: NotificationLevel,
        message: &str,
        record: Option<&serde_json::Value>,
    ) {
        if !self.should_send(level) {
            return;
        }
        let Some(url) = &self.url else {
            return;
        };

        let payload = NotificationPayload {
            timestamp_ms: now_ms(),
            level,
            message,
            record,
        };

        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                log::warn!("Notification webhook returned {}", response.status());
            }
            Err(err) => {
                log::warn!("Failed posting notification: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_gates_info_messages() {
        let notifier = Notifier::new(Some("http://localhost:1".into()), NotificationLevel::Error);
        assert!(!notifier.should_send(NotificationLevel::Info));
        assert!(notifier.should_send(NotificationLevel::Error));

        let chatty = Notifier::new(Some("http://localhost:1".into()), NotificationLevel::Info);
        assert!(chatty.should_send(NotificationLevel::Info));

        assert!(!Notifier::disabled().should_send(NotificationLevel::Error));
    }
}
