use anyhow::Result;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Extension, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::env;
use std::net::SocketAddr;
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::net::TcpListener;

use soil_telemetry::condition::ConditionView;
use soil_telemetry::policy::SettingsError;
use soil_telemetry::stats::{trend, ConditionDistribution, EfficiencyRating, MoistureSummary, Trend};
use soil_telemetry::{
    classify, desired_pump_state, format_runtime, parse_timestamp, recommend, Connectivity,
    DeviceState, Fetched, PumpState, Reading, Recommendation, RuntimeAccumulator, Settings,
    Thresholds, Trigger,
};

use crate::auth::{AuthError, Session};
use crate::devices::{check_device_id, Metric, Report, Sample, StatePatch};
use crate::state::{AppState, StatusResponse};
use crate::store::InvalidKey;

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Window for the short-term trend on the stats endpoint.
const TREND_HOURS: f64 = 1.0;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("missing or invalid session")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(settings) = e.downcast_ref::<SettingsError>() {
            ApiError::Unprocessable(settings.to_string())
        } else if let Some(key) = e.downcast_ref::<InvalidKey>() {
            ApiError::BadRequest(key.to_string())
        } else {
            ApiError::Unavailable(format!("{e:#}"))
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(AuthError::InvalidCredentials) | ApiError::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Auth(AuthError::EmailNotFound) => StatusCode::NOT_FOUND,
            ApiError::Auth(AuthError::EmailExists) => StatusCode::CONFLICT,
            ApiError::Auth(AuthError::WeakPassword) | ApiError::Unprocessable(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Auth(AuthError::Unknown(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), "request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", delete(api_clear_history))
        .route("/api/history/{metric}", get(api_history))
        .route("/api/runtime", get(api_runtime))
        .route("/api/stats", get(api_stats))
        .route("/api/pump", post(api_pump))
        .route("/api/settings", put(api_settings))
        .route("/api/devices/{id}/readings", post(api_ingest_reading))
        .route("/api/devices/{id}/state", patch(api_patch_state))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route("/", get(index))
        .route("/api/health", get(api_health))
        .route("/api/auth/signup", post(api_signup))
        .route("/api/auth/signin", post(api_signin))
        .route("/api/auth/signout", post(api_signout))
        .merge(protected)
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn require_session(
    State(app): State<AppState>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let token = bearer_token(req.headers()).ok_or(ApiError::Unauthorized)?;
    let session = app
        .identity
        .session(token)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_health(State(app): State<AppState>) -> impl IntoResponse {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    let rss_mb = system
        .process(pid)
        .map(|p| p.memory() as f64 / 1024.0 / 1024.0);

    let st = app.shared.read().await;
    Json(json!({
        "status": "ok",
        "uptime_secs": st.started_at.elapsed().as_secs(),
        "store_reachable": st.store_reachable,
        "rss_mb": rss_mb,
        "load_avg_1m": System::load_average().one,
    }))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Credentials {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct SessionBody {
    token: String,
    email: String,
}

impl From<Session> for SessionBody {
    fn from(s: Session) -> Self {
        Self {
            token: s.token,
            email: s.email,
        }
    }
}

async fn api_signup(
    State(app): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<Json<SessionBody>> {
    let session = app.identity.sign_up(&body.email, &body.password).await?;
    app.shared
        .write()
        .await
        .record_auth(format!("account created: {}", session.email));
    Ok(Json(session.into()))
}

async fn api_signin(
    State(app): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<Json<SessionBody>> {
    let session = app.identity.sign_in(&body.email, &body.password).await?;
    app.shared
        .write()
        .await
        .record_auth(format!("signed in: {}", session.email));
    Ok(Json(session.into()))
}

async fn api_signout(State(app): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let token = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    app.identity.sign_out(token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusBody {
    device_id: String,
    #[serde(flatten)]
    system: StatusResponse,
    device: DeviceState,
    condition: ConditionView,
    recommendation: Recommendation,
    connectivity: Connectivity,
    /// What auto mode would do with the current reading; absent in manual.
    auto_expectation: Option<PumpState>,
}

async fn api_status(State(app): State<AppState>) -> ApiResult<Json<StatusBody>> {
    let st = app.shared.read().await;
    let Some(device) = st.device.clone() else {
        let reason = st
            .last_error
            .clone()
            .unwrap_or_else(|| "no device snapshot yet".to_string());
        return Err(ApiError::Unavailable(reason));
    };

    let moisture = device.moisture();
    let pump = device.actuators.pump.status;
    let auto_expectation = device
        .settings
        .auto_mode
        .then(|| desired_pump_state(&device.settings, pump, moisture));

    Ok(Json(StatusBody {
        device_id: app.config.dashboard.device_id.clone(),
        system: st.to_status(),
        condition: classify(moisture).describe(),
        recommendation: recommend(moisture, pump),
        connectivity: device.connectivity(OffsetDateTime::now_utc()),
        auto_expectation,
        device,
    }))
}

// ---------------------------------------------------------------------------
// History / runtime / stats
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WindowQuery {
    hours: Option<f64>,
}

impl WindowQuery {
    fn hours(&self, app: &AppState) -> ApiResult<f64> {
        let hours = self
            .hours
            .unwrap_or(app.config.dashboard.default_history_hours);
        if !(hours.is_finite() && hours > 0.0) {
            return Err(ApiError::BadRequest(format!(
                "hours must be a positive number, got {hours}"
            )));
        }
        Ok(hours)
    }
}

/// Fetch a window, turning a store failure into 503.
async fn window(app: &AppState, metric: Metric, hours: f64, now: OffsetDateTime) -> ApiResult<Vec<Reading>> {
    let device_id = &app.config.dashboard.device_id;
    match app.devices.history(device_id, metric, hours, now).await {
        Fetched::Failed(reason) => Err(ApiError::Unavailable(reason)),
        fetched => Ok(fetched.items().map(<[Reading]>::to_vec).unwrap_or_default()),
    }
}

async fn api_history(
    State(app): State<AppState>,
    Path(metric): Path<String>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<Fetched<Vec<Reading>>>> {
    let metric: Metric = metric.parse().map_err(ApiError::BadRequest)?;
    let hours = q.hours(&app)?;
    let readings = window(&app, metric, hours, OffsetDateTime::now_utc()).await?;

    let local: Vec<Reading> = readings
        .iter()
        .map(|r| r.in_offset(app.display_offset))
        .collect();
    Ok(Json(Fetched::from_result(Ok::<_, ApiError>(local))))
}

#[derive(Serialize)]
struct RuntimeBody {
    hours: f64,
    seconds: f64,
    formatted: String,
    transitions: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    running_since: Option<OffsetDateTime>,
}

async fn api_runtime(
    State(app): State<AppState>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<RuntimeBody>> {
    let hours = q.hours(&app)?;
    let now = OffsetDateTime::now_utc();
    let readings = window(&app, Metric::Pump, hours, now).await?;

    let mut acc = RuntimeAccumulator::new();
    for r in &readings {
        acc.observe(r);
    }
    let running_since = acc.open_since().map(|t| t.to_offset(app.display_offset));
    let seconds = acc.finish(now);

    Ok(Json(RuntimeBody {
        hours,
        seconds,
        formatted: format_runtime(seconds),
        transitions: readings.len(),
        running_since,
    }))
}

#[derive(Serialize)]
struct StatsBody {
    hours: f64,
    summary: Option<MoistureSummary>,
    distribution: ConditionDistribution,
    efficiency_pct: Option<f64>,
    efficiency_rating: Option<EfficiencyRating>,
    trend: Option<Trend>,
}

async fn api_stats(
    State(app): State<AppState>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<Json<StatsBody>> {
    let hours = q.hours(&app)?;
    let now = OffsetDateTime::now_utc();
    let readings = window(&app, Metric::Moisture, hours, now).await?;

    let trend_cutoff = now - Duration::seconds_f64(TREND_HOURS * 3600.0);
    let recent: Vec<Reading> = readings
        .iter()
        .filter(|r| r.timestamp > trend_cutoff)
        .cloned()
        .collect();

    let distribution = ConditionDistribution::from_readings(&readings);
    Ok(Json(StatsBody {
        hours,
        summary: MoistureSummary::from_readings(&readings),
        efficiency_pct: distribution.efficiency_pct(),
        efficiency_rating: distribution.efficiency_rating(),
        distribution,
        trend: trend(&recent),
    }))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PumpRequest {
    status: String,
}

async fn api_pump(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Json(body): Json<PumpRequest>,
) -> ApiResult<Json<DeviceState>> {
    let status = PumpState::parse_command(&body.status).map_err(ApiError::BadRequest)?;
    let device_id = &app.config.dashboard.device_id;
    let device = app
        .devices
        .set_pump(device_id, status, OffsetDateTime::now_utc())
        .await?;

    let mut st = app.shared.write().await;
    st.record_pump(format!("pump {status} (manual, {})", session.email));
    st.device = Some(device.clone());
    Ok(Json(device))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsRequest {
    auto_mode: bool,
    low: f64,
    high: f64,
}

async fn api_settings(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
    Json(body): Json<SettingsRequest>,
) -> ApiResult<Json<Settings>> {
    let settings = Settings {
        auto_mode: body.auto_mode,
        thresholds: Thresholds {
            low: body.low,
            high: body.high,
        },
    };
    let device_id = &app.config.dashboard.device_id;
    app.devices.update_settings(device_id, settings).await?;

    app.shared.write().await.record_settings(format!(
        "auto={} low={} high={} ({})",
        settings.auto_mode, settings.thresholds.low, settings.thresholds.high, session.email
    ));
    Ok(Json(settings))
}

async fn api_clear_history(
    State(app): State<AppState>,
    Extension(session): Extension<Session>,
) -> ApiResult<StatusCode> {
    let device_id = &app.config.dashboard.device_id;
    app.devices.clear_history(device_id).await?;
    app.shared
        .write()
        .await
        .record_system(format!("history cleared ({})", session.email));
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Device ingest
// ---------------------------------------------------------------------------

/// A history entry as a device posts it.  Unrecognised fields are stored
/// with the entry.
#[derive(Deserialize)]
struct ReadingRequest {
    metric: String,
    value: Value,
    trigger: Option<Trigger>,
    timestamp: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl ReadingRequest {
    fn into_sample(self, now: OffsetDateTime) -> ApiResult<Sample> {
        let metric: Metric = self.metric.parse().map_err(ApiError::BadRequest)?;
        let report = match metric {
            Metric::Moisture => {
                let value = Reading::new(now, self.value.clone()).moisture().ok_or_else(|| {
                    ApiError::BadRequest(format!("moisture value {} is not a number", self.value))
                })?;
                Report::Moisture(value)
            }
            Metric::Pump => {
                let status = self
                    .value
                    .as_str()
                    .ok_or_else(|| ApiError::BadRequest("pump value must be ON or OFF".into()))
                    .and_then(|v| PumpState::parse_command(v).map_err(ApiError::BadRequest))?;
                Report::Pump {
                    status,
                    trigger: self.trigger.unwrap_or(Trigger::Auto),
                }
            }
        };
        let at = match self.timestamp.as_deref() {
            Some(ts) => parse_timestamp(ts).ok_or_else(|| {
                ApiError::BadRequest(format!("timestamp '{ts}' has no recognisable offset"))
            })?,
            None => now,
        };

        Ok(Sample {
            report,
            at,
            extra: self.extra,
        })
    }
}

async fn api_ingest_reading(
    State(app): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<ReadingRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    check_device_id(&device_id).map_err(ApiError::BadRequest)?;
    let now = OffsetDateTime::now_utc();
    let sample = body.into_sample(now)?;
    let key = app.devices.record_reading(&device_id, &sample, now).await?;

    if let Report::Pump { status, trigger } = sample.report {
        app.shared
            .write()
            .await
            .record_pump(format!("pump {status} ({trigger:?}, reported by {device_id})"));
    }
    Ok((StatusCode::CREATED, Json(json!({ "key": key }))))
}

async fn api_patch_state(
    State(app): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<StatePatch>,
) -> ApiResult<StatusCode> {
    check_device_id(&device_id).map_err(ApiError::BadRequest)?;
    app.devices
        .patch_state(&device_id, &body, OffsetDateTime::now_utc())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(state);

    #[cfg(feature = "tls")]
    if let (Ok(cert), Ok(key)) = (env::var("TLS_CERT"), env::var("TLS_KEY")) {
        use anyhow::Context;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
            .await
            .with_context(|| format!("failed to load TLS cert {cert} / key {key}"))?;
        tracing::info!(%addr, "dashboard listening on https");
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await
            .context("web server error")?;
        return Ok(());
    }

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "dashboard listening on http");
    axum::serve(listener, app).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
