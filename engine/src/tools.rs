use tokio::task::JoinHandle;

/// Current UTC time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now();
    let duration_since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    duration_since_epoch.as_millis() as i64
}

/// Formats an epoch-ms timestamp as `HH:MM:SS` (UTC). Used for log lines
/// and operator notifications; full timestamps stay numeric.
pub fn clock_str(timestamp_ms: i64) -> String {
    let secs = timestamp_ms.div_euclid(1000);
    let (h, m, s) = (
        secs.div_euclid(3600).rem_euclid(24),
        secs.div_euclid(60).rem_euclid(60),
        secs.rem_euclid(60),
    );
    format!("{h:02}:{m:02}:{s:02}")
}

/// Aborts a spawned task and waits for it to wind down.
pub async fn cancel_task<T>(task: Option<JoinHandle<T>>) {
    if let Some(task) = task {
        if task.is_finished() {
            return;
        }
        task.abort();
        let _ = task.await;
    }
}

/// Returns `true` if the process appears to run inside a container.
/// Interactive prompts are disabled in that case.
pub fn is_container() -> bool {
    match std::env::var("IS_CONTAINER") {
        Ok(value) => !matches!(value.as_str(), "" | "0"),
        Err(_) => false,
    }
}
