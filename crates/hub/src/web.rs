use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::aggregation::AggregatedReading;
use crate::analytics::AnalyticsReport;
use crate::error::SensorError;
use crate::manager::{ConnectionManager, DeviceSnapshot, StatusReport};
use crate::model::{
    AggregationMethod, CalibrationRecord, DeviceRegistration, ReferenceMeasurement, SensorAlert,
    SensorDevice, SensorGroup, SensorReading,
};

type AppState = Arc<ConnectionManager>;

/// Analytics window used when the query leaves `start` out.
const DEFAULT_WINDOW: time::Duration = time::Duration::hours(24);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub struct ApiError(SensorError);

impl From<SensorError> for ApiError {
    fn from(e: SensorError) -> Self {
        Self(e)
    }
}

pub fn status_for(e: &SensorError) -> StatusCode {
    match e {
        SensorError::Configuration { .. }
        | SensorError::InvalidCalibrationInput(_)
        | SensorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SensorError::UnknownSensor(_) | SensorError::UnknownGroup(_) | SensorError::UnknownAlert(_) => {
            StatusCode::NOT_FOUND
        }
        SensorError::DuplicateSensor(_)
        | SensorError::SensorInUse { .. }
        | SensorError::UnsupportedOperation(_) => StatusCode::CONFLICT,
        SensorError::CalibrationValidation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SensorError::Connection { .. }
        | SensorError::ReadTimeout { .. }
        | SensorError::Read { .. }
        | SensorError::Parse { .. } => StatusCode::BAD_GATEWAY,
        SensorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, %status, "request failed");
        } else {
            debug!(error = %self.0, %status, "request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(manager: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/sensors", get(list_sensors).post(register_sensor))
        .route("/api/sensors/{id}", get(get_sensor).delete(deregister_sensor))
        .route("/api/sensors/{id}/connect", post(connect_sensor))
        .route("/api/sensors/{id}/disconnect", post(disconnect_sensor))
        .route(
            "/api/sensors/{id}/calibrations",
            get(list_calibrations).post(calibrate_sensor),
        )
        .route("/api/sensors/{id}/analytics", get(sensor_analytics))
        .route("/api/groups", get(list_groups))
        .route("/api/groups/{id}", put(put_group).get(get_group).delete(delete_group))
        .route("/api/groups/{id}/aggregate", get(aggregate_group))
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/api/alerts/{id}/resolve", post(resolve_alert))
        .with_state(manager)
}

async fn api_status(State(m): State<AppState>) -> Json<StatusReport> {
    Json(m.status_report().await)
}

// -- Sensors ------------------------------------------------------------------

async fn list_sensors(State(m): State<AppState>) -> Json<Vec<DeviceSnapshot>> {
    Json(m.devices().await)
}

/// Register, then connect in the background. Connect failures surface
/// through the device's status and the retry schedule, not this response.
async fn register_sensor(
    State(m): State<AppState>,
    Json(registration): Json<DeviceRegistration>,
) -> ApiResult<(StatusCode, Json<SensorDevice>)> {
    let device = m.register(registration).await?;
    m.connect_in_background(&device.id);
    Ok((StatusCode::CREATED, Json(device)))
}

#[derive(Serialize)]
struct SensorDetail {
    #[serde(flatten)]
    snapshot: DeviceSnapshot,
    latest: Option<SensorReading>,
}

async fn get_sensor(State(m): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<SensorDetail>> {
    let snapshot = m.device(&id).await?;
    Ok(Json(SensorDetail {
        snapshot,
        latest: m.latest_reading(&id),
    }))
}

async fn deregister_sensor(State(m): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    m.deregister(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn connect_sensor(State(m): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<DeviceSnapshot>> {
    m.connect(&id).await?;
    Ok(Json(m.device(&id).await?))
}

async fn disconnect_sensor(State(m): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<DeviceSnapshot>> {
    m.disconnect(&id).await?;
    Ok(Json(m.device(&id).await?))
}

// -- Calibration & analytics ----------------------------------------------------

#[derive(Deserialize)]
struct CalibrationRequest {
    measurements: Vec<ReferenceMeasurement>,
}

/// 201 with the record when the fit is adopted, 422 with the record when
/// it failed validation.
async fn calibrate_sensor(
    State(m): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CalibrationRequest>,
) -> ApiResult<Response> {
    let record = m.calibrate(&id, req.measurements).await?;
    Ok(match record.clone().into_result() {
        Ok(adopted) => (StatusCode::CREATED, Json(adopted)).into_response(),
        Err(e) => (
            status_for(&e),
            Json(json!({ "error": e.to_string(), "record": record })),
        )
            .into_response(),
    })
}

async fn list_calibrations(
    State(m): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<CalibrationRecord>>> {
    Ok(Json(m.calibrations(&id).await?))
}

#[derive(Deserialize)]
struct WindowQuery {
    start: Option<String>,
    end: Option<String>,
}

fn parse_instant(field: &str, raw: &str) -> Result<OffsetDateTime, SensorError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|e| SensorError::InvalidRequest(format!("{field} {raw:?} is not RFC 3339: {e}")))
}

async fn sensor_analytics(
    State(m): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<AnalyticsReport>> {
    let end = match q.end.as_deref() {
        Some(raw) => parse_instant("end", raw)?,
        None => OffsetDateTime::now_utc(),
    };
    let start = match q.start.as_deref() {
        Some(raw) => parse_instant("start", raw)?,
        None => end - DEFAULT_WINDOW,
    };
    Ok(Json(m.analytics(&id, start, end).await?))
}

// -- Groups -------------------------------------------------------------------

#[derive(Deserialize)]
struct GroupBody {
    #[serde(alias = "members")]
    member_sensor_ids: Vec<String>,
    #[serde(default, alias = "method")]
    aggregation_method: AggregationMethod,
    #[serde(default)]
    weights: BTreeMap<String, f64>,
    #[serde(default)]
    freshness_secs: Option<u64>,
}

async fn list_groups(State(m): State<AppState>) -> Json<Vec<SensorGroup>> {
    Json(m.groups())
}

async fn put_group(
    State(m): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<GroupBody>,
) -> ApiResult<Json<SensorGroup>> {
    let group = SensorGroup {
        id,
        member_sensor_ids: body.member_sensor_ids,
        aggregation_method: body.aggregation_method,
        weights: body.weights,
        freshness_secs: body.freshness_secs,
    };
    Ok(Json(m.upsert_group(group).await?))
}

async fn get_group(State(m): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<SensorGroup>> {
    Ok(Json(m.group(&id)?))
}

async fn delete_group(State(m): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    m.remove_group(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn aggregate_group(
    State(m): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AggregatedReading>> {
    Ok(Json(m.aggregate(&id)?))
}

// -- Alerts -------------------------------------------------------------------

#[derive(Deserialize)]
struct AlertQuery {
    sensor_id: Option<String>,
    #[serde(default)]
    include_resolved: bool,
}

async fn list_alerts(State(m): State<AppState>, Query(q): Query<AlertQuery>) -> Json<Vec<SensorAlert>> {
    Json(m.alerts(q.sensor_id.as_deref(), q.include_resolved))
}

async fn acknowledge_alert(State(m): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<SensorAlert>> {
    Ok(Json(m.acknowledge(&id).await?))
}

async fn resolve_alert(State(m): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<SensorAlert>> {
    Ok(Json(m.resolve(&id).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    manager: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
