use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::control::{Command, ControlHandle};
use crate::diagnostics::HostDiagnostics;
use crate::hardware::PinName;
use crate::settings::PoolSettings;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchState {
    pub active: bool,
    /// Optional duration in minutes for the watering switches.
    #[serde(default)]
    pub value: i32,
}

#[derive(Debug, Serialize)]
struct IoState {
    active: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }

    fn unavailable(err: anyhow::Error) -> Self {
        Self(StatusCode::SERVICE_UNAVAILABLE, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

/// Switches that are state flags rather than relays.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Flag {
    PumpForceOn,
    PumpForceOff,
    WateringScheduleEnabled,
}

impl Flag {
    fn parse(name: &str) -> Option<Flag> {
        [
            ("PumpForceOn", Flag::PumpForceOn),
            ("PumpForceOff", Flag::PumpForceOff),
            ("WateringScheduleEnabled", Flag::WateringScheduleEnabled),
        ]
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, f)| f)
    }
}

fn positive(value: i32) -> Option<i32> {
    (value > 0).then_some(value)
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(control: ControlHandle) -> Router {
    Router::new()
        .route("/api/v1/status", get(api_status))
        .route("/api/v1/status/details", get(api_details))
        .route("/api/v1/io/{name}", get(get_io).post(set_io))
        .route("/api/v1/action/{name}", post(action))
        .route("/api/v1/variables", get(variables))
        .route("/api/v1/diagnostics", get(diagnostics))
        .route("/api/client/settings", get(get_settings).post(save_settings))
        .route("/api/client/states", get(api_status))
        .with_state(control)
}

async fn api_status(State(control): State<ControlHandle>) -> impl IntoResponse {
    let snap = control.status().read().await;
    Json(snap.to_status())
}

async fn api_details(State(control): State<ControlHandle>) -> impl IntoResponse {
    let snap = control.status().read().await;
    Json(snap.to_details())
}

async fn variables(State(control): State<ControlHandle>) -> impl IntoResponse {
    let snap = control.status().read().await;
    Json(snap.state.variables())
}

async fn diagnostics() -> Result<Json<HostDiagnostics>, ApiError> {
    tokio::task::spawn_blocking(HostDiagnostics::collect)
        .await
        .map(Json)
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn get_io(
    State(control): State<ControlHandle>,
    Path(name): Path<String>,
) -> Result<Json<IoState>, ApiError> {
    let snap = control.status().read().await;
    let active = if let Some(flag) = Flag::parse(&name) {
        match flag {
            Flag::PumpForceOn => snap.state.pump_force_on.value,
            Flag::PumpForceOff => snap.state.pump_force_off.value,
            Flag::WateringScheduleEnabled => snap.state.watering_schedule_enabled.value,
        }
    } else {
        match PinName::parse(&name) {
            Some(pin) if !pin.is_input() => snap.output(pin),
            _ => return Err(ApiError::bad_request(format!("unknown output '{name}'"))),
        }
    };
    Ok(Json(IoState { active }))
}

async fn set_io(
    State(control): State<ControlHandle>,
    Path(name): Path<String>,
    Json(switch): Json<SwitchState>,
) -> Result<StatusCode, ApiError> {
    let command = match (Flag::parse(&name), PinName::parse(&name)) {
        (Some(Flag::PumpForceOn), _) => Command::SetPumpForceOn(switch.active),
        (Some(Flag::PumpForceOff), _) => Command::SetPumpForceOff(switch.active),
        (Some(Flag::WateringScheduleEnabled), _) => Command::SetWateringSchedule {
            enabled: switch.active,
            duration: positive(switch.value),
        },
        (None, Some(PinName::Watering)) => Command::SetWateringManual {
            on: switch.active,
            duration: positive(switch.value),
        },
        (None, Some(pin)) if pin.is_light() => Command::SetLight {
            pin,
            on: switch.active,
        },
        _ => return Err(ApiError::bad_request(format!("'{name}' cannot be switched"))),
    };
    control.send(command).await.map_err(ApiError::unavailable)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn action(
    State(control): State<ControlHandle>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let command = match name.as_str() {
        "OpenCover" => Command::OpenCover,
        "CloseCover" => Command::CloseCover,
        "StopCover" => Command::StopCover,
        _ => return Err(ApiError::bad_request(format!("unknown action '{name}'"))),
    };
    control.send(command).await.map_err(ApiError::unavailable)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_settings(State(control): State<ControlHandle>) -> impl IntoResponse {
    let snap = control.status().read().await;
    Json(snap.settings.as_ref().clone())
}

async fn save_settings(
    State(control): State<ControlHandle>,
    Json(settings): Json<PoolSettings>,
) -> Result<StatusCode, ApiError> {
    control
        .save_settings(settings)
        .await
        .map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(control: ControlHandle) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(control);

    #[cfg(feature = "tls")]
    if let (Ok(cert), Ok(key)) = (env::var("TLS_CERT_PATH"), env::var("TLS_KEY_PATH")) {
        use anyhow::Context;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
            .await
            .with_context(|| format!("failed to load tls certificate {cert}"))?;
        info!("web api listening on https://{addr}");
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await
            .context("web server error")?;
        return Ok(());
    }

    let listener = TcpListener::bind(addr).await?;
    info!("web api listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
