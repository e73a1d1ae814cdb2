//! Operational HTTP surface.
//!
//! A thin axum server that reports whether a fill is running and lets the
//! observatory tooling trigger or abort one. Fills started here run the
//! exact same engine path as the CLI.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{Action, Config};
use crate::lock;
use crate::runner;

/// Env var holding the base64-encoded password that authorises manual
/// fills.
const FILL_PASSWORD_VAR: &str = "CRYOFILL_FILL_PASSWORD";

pub struct ServerState {
    config: Config,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/filling", get(filling))
        .route("/manual-fill", post(manual_fill))
        .route("/abort", get(abort))
        .with_state(state)
}

async fn ping() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn filling(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({ "filling": lock::lockfile_exists(&state.config.lock_path) }))
}

#[derive(Debug, Deserialize, Default)]
struct ManualFillQuery {
    #[serde(default)]
    clear_lock: bool,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ManualFillBody {
    password: Option<String>,
}

fn refused(reason: &str) -> Json<Value> {
    Json(json!({ "result": false, "reason": reason }))
}

async fn manual_fill(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ManualFillQuery>,
    body: Option<Json<ManualFillBody>>,
) -> Json<Value> {
    let Ok(encoded) = std::env::var(FILL_PASSWORD_VAR) else {
        return refused("Fill password not available.");
    };
    let expected = match BASE64
        .decode(encoded.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(expected) => expected,
        None => return refused("Fill password not available."),
    };

    let given = body
        .and_then(|Json(body)| body.password)
        .unwrap_or_default();
    if given != expected {
        return refused("Invalid password.");
    }

    if lock::lockfile_exists(&state.config.lock_path) && !query.clear_lock {
        return refused("Lock file exists. LN2 fill already in progress.");
    }

    let mut config = state.config.clone();
    config.action = Action::PurgeAndFill;
    config.clear_lock = query.clear_lock;
    config.dry_run = config.dry_run || query.dry_run;
    config.interactive = false;
    config.no_prompt = true;

    // The route returns immediately; the fill runs in the background.
    tokio::spawn(async move {
        let drivers = runner::build_drivers(&config);
        let code = runner::run(&config, &drivers).await;
        if code != 0 {
            log::error!("Manual fill ended with exit code {code}.");
        }
    });

    Json(json!({ "result": true }))
}

#[derive(Debug, Deserialize, Default)]
struct AbortQuery {
    #[serde(default)]
    wait: bool,
}

async fn abort(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AbortQuery>,
) -> Json<Value> {
    let config = state.config.clone();
    let task = tokio::spawn(async move {
        let drivers = runner::build_drivers(&config);
        if let Err(err) = drivers.nps.close_all(&config.valves).await {
            log::error!("{err:#}");
        }
        if let Err(err) = lock::clear_lock(&config.lock_path) {
            log::error!("Failed removing the lock file: {err}");
        }
    });

    if query.wait {
        let _ = task.await;
    }

    Json(json!({ "result": true }))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Failed to install Ctrl+C handler: {err}");
        std::future::pending::<()>().await;
    }
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = config.listen.clone();
    let state = Arc::new(ServerState { config });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Serving on {addr}.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
