use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::api::TelemetrySource;
use crate::controller::Controller;
use crate::db::Db;
use crate::error::ControlError;
use crate::registry::{DeviceKey, DeviceKind, NutrientProfile, Settings};
use crate::state::SharedState;

const DEFAULT_DISPATCH_LIMIT: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub controller: Arc<Controller>,
    pub telemetry: Arc<dyn TelemetrySource>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        let status = match &e {
            ControlError::UnknownDevice(_) | ControlError::NoTelemetry(_) => StatusCode::NOT_FOUND,
            ControlError::AlreadyInProgress(_) => StatusCode::CONFLICT,
            ControlError::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::DispatchFailed(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("request failed: {e:#}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_key(kind: &str, id: String) -> ApiResult<DeviceKey> {
    let kind: DeviceKind = kind.parse().map_err(ApiError::not_found)?;
    Ok(DeviceKey::new(kind, id))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices/{kind}", post(add_device))
        .route("/api/devices/{kind}/{id}", delete(remove_device))
        .route("/api/devices/{kind}/{id}/command", get(preview_command))
        .route("/api/devices/{kind}/{id}/toggle", post(toggle_device))
        .route("/api/devices/{kind}/{id}/telemetry", get(device_telemetry))
        .route("/api/nutrient-mix", get(nutrient_mix))
        .route("/api/tanks/{id}/nutrients", put(update_nutrients))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/settings/reset", post(reset_settings))
        .route("/api/dispatches", get(recent_dispatches))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

/// The message a toggle would send right now, without sending it.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandPreview {
    key: DeviceKey,
    phone: String,
    message: String,
    target_on: bool,
}

async fn preview_command(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = parse_key(&kind, id)?;
    let st = state.shared.read().await;
    let identity = st
        .settings
        .identity(&key)
        .ok_or_else(|| ControlError::UnknownDevice(key.clone()))?;
    let target_on = !st.is_on(&key);
    let message = st.settings.template.render(target_on, identity);
    Ok(Json(CommandPreview {
        phone: st.settings.phone_number.clone(),
        message,
        target_on,
        key,
    }))
}

async fn toggle_device(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = parse_key(&kind, id)?;
    let dispatch = state.controller.toggle(&key).await?;
    Ok(Json(dispatch))
}

async fn device_telemetry(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = parse_key(&kind, id)?;
    let reading = state
        .controller
        .refresh_telemetry(&key, state.telemetry.as_ref())
        .await?;
    Ok(Json(reading))
}

async fn nutrient_mix(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.nutrient_mix())
}

/// Apply `edit` to a copy of the live settings, persist it and swap it in.
///
/// The write guard is held from the copy until the swap, so concurrent
/// edits apply one after another instead of overwriting each other.
async fn edit_settings<T>(
    state: &AppState,
    edit: impl FnOnce(&mut Settings) -> ApiResult<T>,
) -> ApiResult<T> {
    let mut st = state.shared.write().await;
    let mut next = st.settings.clone();
    let out = edit(&mut next)?;
    for warning in next.lint() {
        warn!("settings: {warning}");
    }
    state.db.save_settings(&next).await?;
    st.replace_settings(next);
    Ok(out)
}

async fn update_nutrients(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(profile): Json<NutrientProfile>,
) -> ApiResult<impl IntoResponse> {
    let updated = edit_settings(&state, |next| {
        let tank = next
            .tank_mut(&id)
            .ok_or_else(|| ApiError::not_found(format!("unknown tank '{id}'")))?;
        tank.nutrient = profile.with_blank_as_zero();
        if tank.nutrient.exceeds_full_strength() {
            warn!(tank = %id, total = tank.nutrient.total(), "nutrient profile exceeds 100%");
        }
        Ok(tank.clone())
    })
    .await?;
    info!(tank = %id, "nutrient profile updated");

    let mix = state.shared.read().await.nutrient_mix();
    Ok(Json(json!({ "tank": updated, "nutrientMix": mix })))
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.settings.clone())
}

/// Accepts a full or partial settings document; absent top-level keys keep
/// their current values.
async fn put_settings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<impl IntoResponse> {
    let next = edit_settings(&state, |current| {
        *current = current.merged_with(body).map_err(|e| {
            ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, format!("invalid settings: {e}"))
        })?;
        Ok(current.clone())
    })
    .await?;
    info!("settings saved");
    let warnings = next.lint();
    Ok(Json(json!({ "settings": next, "warnings": warnings })))
}

async fn reset_settings(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut st = state.shared.write().await;
    let defaults = state.db.reset_settings().await?;
    st.replace_settings(defaults.clone());
    info!("settings reset to defaults");
    Ok(Json(defaults))
}

async fn add_device(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let kind: DeviceKind = kind.parse().map_err(ApiError::not_found)?;
    let key = edit_settings(&state, |next| match kind {
        DeviceKind::Motor => Ok(next.add_motor()),
        DeviceKind::Valve => Ok(next.add_valve()),
        DeviceKind::Tank | DeviceKind::DosingPump => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("{kind} devices cannot be added"),
        )),
    })
    .await?;
    info!(device = %key, "device added");
    Ok((StatusCode::CREATED, Json(key)))
}

async fn remove_device(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = parse_key(&kind, id)?;
    edit_settings(&state, |next| {
        if !next.contains(&key) {
            return Err(ControlError::UnknownDevice(key.clone()).into());
        }
        if !next.remove_device(&key) {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("{} devices cannot be removed", key.kind),
            ));
        }
        Ok(())
    })
    .await?;
    info!(device = %key, "device removed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct DispatchQuery {
    limit: Option<i64>,
}

async fn recent_dispatches(
    State(state): State<AppState>,
    Query(q): Query<DispatchQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = q.limit.unwrap_or(DEFAULT_DISPATCH_LIMIT).clamp(1, 500);
    Ok(Json(state.db.recent_dispatches(limit).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sms::{LogTransport, SendResult, SmsError, SmsTransport};
    use crate::state::PanelState;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NoTelemetry;

    #[async_trait]
    impl TelemetrySource for NoTelemetry {
        async fn fetch(&self, _sensor_id: &str) -> Option<Value> {
            None
        }
    }

    struct Offline;

    #[async_trait]
    impl SmsTransport for Offline {
        async fn is_available(&self) -> bool {
            false
        }

        async fn send(&self, _phone: &str, _message: &str) -> Result<SendResult, SmsError> {
            Err(SmsError::NotConfigured)
        }
    }

    async fn app_with(transport: Arc<dyn SmsTransport>) -> (Router, AppState) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let shared = PanelState::shared(db.load_settings().await.unwrap());
        let controller = Controller::new(shared.clone(), transport).with_dispatch_log(db.clone());
        let state = AppState {
            shared,
            db,
            controller: Arc::new(controller),
            telemetry: Arc::new(NoTelemetry),
        };
        (router(state.clone()), state)
    }

    async fn app() -> (Router, AppState) {
        app_with(Arc::new(LogTransport)).await
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    // -- Status -------------------------------------------------------------

    #[tokio::test]
    async fn status_lists_devices() {
        let (app, _) = app().await;
        let (status, body) = call(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"].as_array().unwrap().len(), 11);
        assert_eq!(body["devices"][0]["on"], false);
    }

    // -- Toggle -------------------------------------------------------------

    #[tokio::test]
    async fn toggle_flips_and_logs() {
        let (app, state) = app().await;
        let (status, body) = call(&app, Method::POST, "/api/devices/valve/valve1/toggle", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "ON V1");
        assert_eq!(body["on"], true);
        assert!(state.shared.read().await.is_on(&DeviceKey::valve("valve1")));

        let (_, rows) = call(&app, Method::GET, "/api/dispatches?limit=5", None).await;
        assert_eq!(rows[0]["message"], "ON V1");
        assert_eq!(rows[0]["outcome"], "sent");
    }

    #[tokio::test]
    async fn toggle_unknown_device_is_404() {
        let (app, _) = app().await;
        let (status, _) = call(&app, Method::POST, "/api/devices/motor/motor99/toggle", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = call(&app, Method::POST, "/api/devices/pump/p1/toggle", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("unknown device kind"));
    }

    #[tokio::test]
    async fn toggle_without_transport_is_503() {
        let (app, state) = app_with(Arc::new(Offline)).await;
        let (status, body) = call(&app, Method::POST, "/api/devices/motor/motor1/toggle", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "SMS is not available on this device");
        assert!(!state.shared.read().await.is_on(&DeviceKey::motor("motor1")));
    }

    #[tokio::test]
    async fn toggle_in_progress_is_409() {
        let (app, state) = app().await;
        state.shared.write().await.devices.insert(
            DeviceKey::motor("motor1"),
            crate::controller::DeviceState::Dispatching {
                was_on: false,
                target_on: true,
            },
        );
        let (status, _) = call(&app, Method::POST, "/api/devices/motor/motor1/toggle", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    // -- Telemetry ----------------------------------------------------------

    #[tokio::test]
    async fn telemetry_falls_back_to_mock() {
        let (app, _) = app().await;
        let (status, body) = call(&app, Method::GET, "/api/devices/motor/motor1/telemetry", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "mock");
        assert_eq!(body["isLoading"], false);
    }

    #[tokio::test]
    async fn tank_telemetry_is_404() {
        let (app, _) = app().await;
        let (status, _) = call(&app, Method::GET, "/api/devices/tank/tank1/telemetry", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -- Nutrients ----------------------------------------------------------

    #[tokio::test]
    async fn nutrient_edit_persists_and_updates_mix() {
        let (app, state) = app().await;
        call(&app, Method::POST, "/api/devices/tank/tank2/toggle", None).await;

        let profile = json!({ "N": "10", "P": "", "K": "4", "Ca": "2", "Mg": "1", "S": "0" });
        let (status, body) = call(&app, Method::PUT, "/api/tanks/tank2/nutrients", Some(profile)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tank"]["nutrient"]["P"], "0");
        assert_eq!(body["nutrientMix"]["N"], 10.0);

        let stored = state.db.load_settings().await.unwrap();
        assert_eq!(stored.tank("tank2").unwrap().nutrient.n, "10");

        let (_, mix) = call(&app, Method::GET, "/api/nutrient-mix", None).await;
        assert_eq!(mix["K"], 4.0);
    }

    #[tokio::test]
    async fn nutrient_edit_unknown_tank_is_404() {
        let (app, _) = app().await;
        let profile = json!({ "N": "1" });
        let (status, _) = call(&app, Method::PUT, "/api/tanks/tank7/nutrients", Some(profile)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -- Settings -----------------------------------------------------------

    #[tokio::test]
    async fn settings_put_merges_and_persists() {
        let (app, state) = app().await;
        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/settings",
            Some(json!({ "phoneNumber": "+15550001111", "onFormat": "RUN {deviceId}" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["phoneNumber"], "+15550001111");
        assert_eq!(body["settings"]["motors"].as_array().unwrap().len(), 3);
        assert_eq!(body["warnings"][0], "onFormat has no {prefix} placeholder");

        assert_eq!(state.db.load_settings().await.unwrap().phone_number, "+15550001111");

        let (_, d) = call(&app, Method::POST, "/api/devices/motor/motor1/toggle", None).await;
        assert_eq!(d["message"], "RUN 1");
        assert_eq!(d["phone"], "+15550001111");
    }

    #[tokio::test]
    async fn settings_put_rejects_wrong_shape() {
        let (app, _) = app().await;
        let (status, _) = call(&app, Method::PUT, "/api/settings", Some(json!({ "motors": 5 }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn settings_reset_restores_defaults() {
        let (app, _) = app().await;
        call(&app, Method::PUT, "/api/settings", Some(json!({ "phoneNumber": "+1" }))).await;
        let (status, body) = call(&app, Method::POST, "/api/settings/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phoneNumber"], "+917305467054");

        let (_, current) = call(&app, Method::GET, "/api/settings", None).await;
        assert_eq!(current["phoneNumber"], "+917305467054");
    }

    // -- Add / remove -------------------------------------------------------

    #[tokio::test]
    async fn add_and_remove_valve() {
        let (app, state) = app().await;
        let (status, key) = call(&app, Method::POST, "/api/devices/valve", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(key["id"], "valve5");

        let (_, d) = call(&app, Method::POST, "/api/devices/valve/valve5/toggle", None).await;
        assert_eq!(d["message"], "ON V5");

        let (status, _) = call(&app, Method::DELETE, "/api/devices/valve/valve5", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let st = state.shared.read().await;
        assert!(!st.settings.contains(&DeviceKey::valve("valve5")));
        assert!(!st.devices.contains_key(&DeviceKey::valve("valve5")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_edits_are_all_kept() {
        let (app, state) = app().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                call(&app, Method::POST, "/api/devices/motor", None).await
            }));
        }
        let nutrients = {
            let app = app.clone();
            tokio::spawn(async move {
                let profile = json!({ "N": "9", "P": "0", "K": "0", "Ca": "0", "Mg": "0", "S": "0" });
                call(&app, Method::PUT, "/api/tanks/tank1/nutrients", Some(profile)).await
            })
        };

        let mut ids = Vec::new();
        for h in handles {
            let (status, key) = h.await.unwrap();
            assert_eq!(status, StatusCode::CREATED);
            ids.push(key["id"].as_str().unwrap().to_string());
        }
        assert_eq!(nutrients.await.unwrap().0, StatusCode::OK);

        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);

        let live = state.shared.read().await.settings.clone();
        assert_eq!(live.motors.len(), 11);
        assert_eq!(live.tank("tank1").unwrap().nutrient.n, "9");

        let stored = state.db.load_settings().await.unwrap();
        assert_eq!(stored, live);
    }

    #[tokio::test]
    async fn partial_settings_put_keeps_added_devices() {
        let (app, _) = app().await;
        let (_, key) = call(&app, Method::POST, "/api/devices/valve", None).await;
        assert_eq!(key["id"], "valve5");

        let (status, body) =
            call(&app, Method::PUT, "/api/settings", Some(json!({ "phoneNumber": "+1999" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["valves"].as_array().unwrap().len(), 5);

        let (_, current) = call(&app, Method::GET, "/api/settings", None).await;
        assert_eq!(current["valves"][4]["id"], "valve5");
        assert_eq!(current["phoneNumber"], "+1999");
    }

    #[tokio::test]
    async fn command_preview_does_not_send() {
        let (app, state) = app().await;
        let (status, body) = call(&app, Method::GET, "/api/devices/motor/motor2/command", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "ON M2");
        assert_eq!(body["targetOn"], true);
        assert_eq!(body["phone"], "+917305467054");
        assert!(!state.shared.read().await.is_on(&DeviceKey::motor("motor2")));

        call(&app, Method::POST, "/api/devices/motor/motor2/toggle", None).await;
        let (_, body) = call(&app, Method::GET, "/api/devices/motor/motor2/command", None).await;
        assert_eq!(body["message"], "OFF M2");
        assert_eq!(body["targetOn"], false);

        let (_, rows) = call(&app, Method::GET, "/api/dispatches", None).await;
        assert_eq!(rows.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, Method::GET, "/api/devices/valve/valve9/command", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tanks_cannot_be_added_or_removed() {
        let (app, _) = app().await;
        let (status, _) = call(&app, Method::POST, "/api/devices/tank", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, Method::DELETE, "/api/devices/tank/tank1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, Method::DELETE, "/api/devices/motor/motor42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
