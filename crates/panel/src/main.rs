use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_panel::api::{TelemetryClient, TelemetrySource};
use irrigation_panel::config;
use irrigation_panel::controller::Controller;
use irrigation_panel::db::Db;
use irrigation_panel::sms::{HttpSmsGateway, LogTransport, SmsTransport};
use irrigation_panel::state::PanelState;
use irrigation_panel::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "panel.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    cfg.apply_overrides(|key| env::var(key).ok())?;
    cfg.validate()
        .with_context(|| format!("invalid config: {config_path}"))?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;

    // Stored settings are the source of truth for the device registry.
    let settings = db.load_settings().await?;
    for warning in settings.lint() {
        warn!("settings: {warning}");
    }
    info!(
        motors = settings.motors.len(),
        valves = settings.valves.len(),
        tanks = settings.fertigation.tanks.len(),
        "registry loaded"
    );

    // ── SMS transport ───────────────────────────────────────────────
    let transport: Arc<dyn SmsTransport> = match cfg.sms.gateway_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            info!(gateway = url, "sending commands through http sms gateway");
            Arc::new(HttpSmsGateway::new(
                Some(url.to_string()),
                cfg.sms.gateway_token.clone(),
                cfg.sms.timeout(),
            )?)
        }
        _ => {
            warn!("no sms gateway configured, commands will only be logged");
            Arc::new(LogTransport)
        }
    };

    // ── Telemetry ───────────────────────────────────────────────────
    let telemetry: Arc<dyn TelemetrySource> =
        Arc::new(TelemetryClient::new(&cfg.api.base_url, cfg.api.timeout())?);
    info!(base_url = %cfg.api.base_url, "telemetry api configured");

    // ── Shared state ────────────────────────────────────────────────
    let shared = PanelState::shared(settings);
    shared
        .write()
        .await
        .record_system("panel started".to_string());

    let controller = Controller::new(shared.clone(), transport).with_dispatch_log(db.clone());

    // ── Web server ──────────────────────────────────────────────────
    let state = AppState {
        shared,
        db,
        controller: Arc::new(controller),
        telemetry,
    };
    web::serve(state, cfg.web_port).await
}
