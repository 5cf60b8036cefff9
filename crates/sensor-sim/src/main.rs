mod sim;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FeedError, FeedSim, Scenario};

type SharedSim = Arc<Mutex<FeedSim>>;

fn router(sim: SharedSim) -> Router {
    Router::new()
        .route("/{sensor_id}", get(sensor_payload))
        .with_state(sim)
}

async fn sensor_payload(
    State(sim): State<SharedSim>,
    Path(sensor_id): Path<String>,
) -> Response {
    let result = sim.lock().await.payload(&sensor_id);
    match result {
        Ok(payload) => {
            debug!(sensor = %sensor_id, %payload, "served reading");
            Json(payload).into_response()
        }
        Err(e @ FeedError::UnknownSensor) => {
            warn!(sensor = %sensor_id, "unknown sensor requested");
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e @ FeedError::Unavailable) => {
            debug!(sensor = %sensor_id, "simulated outage");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Comma-separated tank ids, e.g. `tank1,tank2,tank3`.
fn parse_tank_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let port: u16 = env::var("SIM_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8090);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let tank_ids = parse_tank_ids(
        &env::var("SIM_TANKS").unwrap_or_else(|_| "tank1,tank2,tank3".to_string()),
    );
    let seed: Option<u64> = env::var("SIM_SEED").ok().and_then(|s| s.parse().ok());

    let sim = FeedSim::new(scenario, tank_ids, seed);
    info!(scenario = %sim.scenario(), "sensor simulator ready");

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("serving telemetry on http://{addr}");

    axum::serve(listener, router(Arc::new(Mutex::new(sim)))).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(scenario: Scenario) -> Router {
        router(Arc::new(Mutex::new(FeedSim::new(
            scenario,
            vec!["tank1".into()],
            Some(5),
        ))))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn serves_numeric_strings() {
        let (status, body) = get_json(app(Scenario::Stable), "/motor_m1").await;
        assert_eq!(status, StatusCode::OK);
        let current: f64 = body["current"].as_str().unwrap().parse().unwrap();
        assert!((5.0..=15.0).contains(&current));
    }

    #[tokio::test]
    async fn unknown_sensor_is_404() {
        let (status, body) = get_json(app(Scenario::Stable), "/weather_w1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown sensor");
    }

    #[tokio::test]
    async fn offline_is_503() {
        let (status, _) = get_json(app(Scenario::Offline), "/valve_v1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn tank_ids_parse() {
        assert_eq!(parse_tank_ids("tank1, tank2,,"), vec!["tank1", "tank2"]);
        assert!(parse_tank_ids("").is_empty());
    }
}
