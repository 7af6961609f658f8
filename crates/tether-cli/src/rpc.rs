//! HTTP boundary between the UI and the launcher.
//!
//! Every procedure validates its input before touching the launcher and
//! holds no state of its own. Mutations are `POST /rpc/<name>` with a JSON
//! body, queries are `GET /rpc/<name>`, and `GET /rpc/onProgress` streams bus
//! publications as server-sent events.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use tether_core::admin::{ExtendedAppInfo, InstallRequest, InstalledApp};
use tether_core::authz::WindowId;
use tether_core::data_root;
use tether_core::events::{EventChannel, LauncherEvent};
use tether_core::launcher::{InstallApplication, Launcher};
use tether_core::runtime_table::RunningRuntime;
use tether_core::signing::{SignedZomeCall, UnsignedZomeCall};
use tether_core::{LauncherError, Secret};

/// Header carrying the id of the window a signing request comes from.
pub const WINDOW_HEADER: &str = "x-tether-window";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<LauncherError> for AppError {
    fn from(err: LauncherError) -> Self {
        let status = match &err {
            LauncherError::Validation(_) => StatusCode::BAD_REQUEST,
            LauncherError::UnknownDataRoot(_) => StatusCode::NOT_FOUND,
            LauncherError::AlreadyLaunching(_)
            | LauncherError::AlreadyRunning(_)
            | LauncherError::DuplicateBinding(_) => StatusCode::CONFLICT,
            LauncherError::UnauthorizedProvenance(_) | LauncherError::NotBound(_) => {
                StatusCode::FORBIDDEN
            }
            LauncherError::Admin(_) | LauncherError::Signing(_) | LauncherError::Window(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            warn!(code = self.code, "{}", self.message);
        }
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

/// Checks applied after an input deserializes.
pub trait Validate {
    fn validate(&self) -> Result<(), LauncherError>;
}

/// JSON body that must deserialize and pass [`Validate`].
///
/// Both failure kinds surface as a `VALIDATION_ERROR`.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate + Send,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| {
                LauncherError::Validation(rejection.body_text())
            })?;
        value.validate()?;
        Ok(Self(value))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretInput {
    pub secret: Secret,
}

impl Validate for SecretInput {
    fn validate(&self) -> Result<(), LauncherError> {
        if self.secret.is_empty() {
            return Err(LauncherError::Validation(
                "secret must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppTarget {
    pub data_root: String,
    pub installed_app_id: String,
}

impl Validate for AppTarget {
    fn validate(&self) -> Result<(), LauncherError> {
        data_root::validate_name("data root", &self.data_root)?;
        require_app_id(&self.installed_app_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallInput {
    pub data_root: String,
    /// Absent means the configured default bundle.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    pub app_id: String,
    #[serde(default)]
    pub network_seed: Option<String>,
}

impl Validate for InstallInput {
    fn validate(&self) -> Result<(), LauncherError> {
        data_root::validate_name("data root", &self.data_root)?;
        require_app_id(&self.app_id)
    }
}

impl InstallInput {
    fn into_install(self) -> InstallApplication {
        InstallApplication {
            data_root: self.data_root,
            request: InstallRequest {
                bundle_path: self.file_path.unwrap_or_default(),
                installed_app_id: self.app_id,
                network_seed: self.network_seed.filter(|s| !s.is_empty()),
            },
        }
    }
}

impl Validate for UnsignedZomeCall {
    fn validate(&self) -> Result<(), LauncherError> {
        if self.provenance.as_bytes().is_empty() {
            return Err(LauncherError::Validation(
                "provenance must not be empty".to_string(),
            ));
        }
        if self.zome_name.is_empty() || self.fn_name.is_empty() {
            return Err(LauncherError::Validation(
                "zomeName and fnName are required".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_app_id(id: &str) -> Result<(), LauncherError> {
    if id.trim().is_empty() {
        return Err(LauncherError::Validation(
            "installed app id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn window_from_headers(headers: &HeaderMap) -> Result<WindowId, LauncherError> {
    let raw = headers
        .get(WINDOW_HEADER)
        .ok_or_else(|| LauncherError::Validation(format!("missing {WINDOW_HEADER} header")))?;
    raw.to_str()
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(WindowId)
        .ok_or_else(|| LauncherError::Validation(format!("malformed {WINDOW_HEADER} header")))
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowOpened {
    pub window_id: WindowId,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(launcher: Arc<Launcher>) -> Router {
    Router::new()
        .route("/rpc/initializeAndLaunch", post(initialize_and_launch))
        .route("/rpc/launch", post(launch))
        .route("/rpc/isKeystoreSetupRequired", get(is_keystore_setup_required))
        .route("/rpc/listInstalledApplications", get(list_installed_applications))
        .route("/rpc/openApplicationWindow", post(open_application_window))
        .route("/rpc/installApplication", post(install_application))
        .route("/rpc/uninstallApplication", post(uninstall_application))
        .route("/rpc/signZomeCall", post(sign_zome_call))
        .route("/rpc/onProgress", get(on_progress))
        .layer(CorsLayer::permissive())
        .with_state(launcher)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve the RPC boundary until `cancel` fires.
pub async fn run_serve(
    launcher: Arc<Launcher>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(launcher);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("tether rpc listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("tether rpc shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn initialize_and_launch(
    State(launcher): State<Arc<Launcher>>,
    ValidatedJson(input): ValidatedJson<SecretInput>,
) -> Result<Json<RunningRuntime>, AppError> {
    Ok(Json(launcher.initialize_and_launch(&input.secret).await?))
}

async fn launch(
    State(launcher): State<Arc<Launcher>>,
    ValidatedJson(input): ValidatedJson<SecretInput>,
) -> Result<Json<RunningRuntime>, AppError> {
    Ok(Json(launcher.launch(&input.secret).await?))
}

async fn is_keystore_setup_required(State(launcher): State<Arc<Launcher>>) -> Json<bool> {
    Json(launcher.is_keystore_setup_required())
}

async fn list_installed_applications(
    State(launcher): State<Arc<Launcher>>,
) -> Json<Vec<ExtendedAppInfo>> {
    Json(launcher.list_installed_applications())
}

async fn open_application_window(
    State(launcher): State<Arc<Launcher>>,
    ValidatedJson(input): ValidatedJson<AppTarget>,
) -> Result<Json<WindowOpened>, AppError> {
    let window_id = launcher
        .open_application_window(&input.data_root, &input.installed_app_id)
        .await?;
    Ok(Json(WindowOpened { window_id }))
}

async fn install_application(
    State(launcher): State<Arc<Launcher>>,
    ValidatedJson(input): ValidatedJson<InstallInput>,
) -> Result<Json<InstalledApp>, AppError> {
    let install = input.into_install();
    Ok(Json(launcher.install_application(&install).await?))
}

async fn uninstall_application(
    State(launcher): State<Arc<Launcher>>,
    ValidatedJson(input): ValidatedJson<AppTarget>,
) -> Result<StatusCode, AppError> {
    launcher
        .uninstall_application(&input.data_root, &input.installed_app_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn sign_zome_call(
    State(launcher): State<Arc<Launcher>>,
    headers: HeaderMap,
    ValidatedJson(call): ValidatedJson<UnsignedZomeCall>,
) -> Result<Json<SignedZomeCall>, AppError> {
    let window_id = window_from_headers(&headers)?;
    Ok(Json(launcher.sign_zome_call(window_id, call).await?))
}

/// Forward progress and readiness publications until the client goes away.
///
/// Subscribing happens before the response is returned, so nothing
/// published earlier is replayed.
async fn on_progress(
    State(launcher): State<Arc<Launcher>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut events = launcher
        .bus()
        .subscribe_all(&[EventChannel::Progress, EventChannel::RuntimeReady]);
    debug!("progress subscriber attached");

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            let encoded = match &event {
                LauncherEvent::Progress(phase) => Event::default().event("progress").json_data(phase),
                LauncherEvent::RuntimeReady(runtime) => {
                    Event::default().event("runtimeReady").json_data(runtime)
                }
                LauncherEvent::Log(_) => continue,
            };
            match encoded {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!(error = %e, "dropping unencodable event"),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
