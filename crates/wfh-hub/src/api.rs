use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;

use serde::Serialize;
use serde_json::{Value, json};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{error, info};

use crate::config::{HEALTH_PATH, UPDATE_CREDENTIALS_PATH, update_env_file};
use crate::credential::{CredentialStore, UserCredentials};
use crate::error::{ErrorKind, Result};

// Dotenv keys of the user credentials.
const USER_EMAIL_KEY: &str = "USER_EMAIL";
const USER_PASSWORD_KEY: &str = "USER_PASSWORD";

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorKind,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<&'a str>,
}

/// A response providing details about an error encountered by the hub
/// `HTTP` interface.
pub struct ErrorResponse(Response);

impl ErrorResponse {
    /// Generates an [`ErrorResponse`] for an internal error.
    ///
    /// Requires specifying a general error description and optional
    /// information about the encountered error.
    #[must_use]
    pub fn internal_with_error(description: &str, error: &str) -> Self {
        let body = ErrorBody {
            error: ErrorKind::Api,
            description,
            info: Some(error),
        };
        Self((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response())
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        self.0
    }
}

#[derive(Clone)]
struct ApiState {
    credentials: Arc<CredentialStore>,
    env_file: Option<Arc<PathBuf>>,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn update_credentials(
    State(state): State<ApiState>,
    Json(user): Json<UserCredentials>,
) -> std::result::Result<Json<&'static str>, ErrorResponse> {
    let email = user.email.clone();
    let password = user.password.clone();
    state.credentials.update_user_credentials(user).await;

    let Some(env_file) = state.env_file else {
        return Ok(Json("Success"));
    };

    let persisted = tokio::task::spawn_blocking(move || {
        update_env_file(&env_file, USER_EMAIL_KEY, &email)?;
        update_env_file(&env_file, USER_PASSWORD_KEY, &password)
    })
    .await;

    match persisted {
        Ok(Ok(())) => Ok(Json("Success")),
        Ok(Err(e)) => {
            error!("Impossible to persist the user credentials: {e}");
            Err(ErrorResponse::internal_with_error(
                "Impossible to persist the user credentials",
                e.description(),
            ))
        }
        Err(e) => {
            error!("Credentials persistence task failed: {e}");
            Err(ErrorResponse::internal_with_error(
                "Credentials persistence task failed",
                &e.to_string(),
            ))
        }
    }
}

/// Builds the hub `HTTP` interface.
///
/// - `GET /API/health` answers with `{"status": "ok"}`
/// - `PUT /API/update-credentials` replaces the user credentials of the
///   [`CredentialStore`] and, when an env file is given, persists them
pub fn router(credentials: Arc<CredentialStore>, env_file: Option<PathBuf>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(UPDATE_CREDENTIALS_PATH, put(update_credentials))
        .with_state(ApiState {
            credentials,
            env_file: env_file.map(Arc::new),
        })
}

/// A running hub `HTTP` interface.
#[derive(Debug)]
pub struct ApiServer {
    address: SocketAddr,
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ApiServer {
    /// Serves the given [`Router`] on `address`.
    ///
    /// # Errors
    ///
    /// An error is returned when the address cannot be bound.
    pub async fn start(address: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        info!("Hub HTTP interface listening on {address}");

        let cancellation_token = CancellationToken::new();
        let shutdown = cancellation_token.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!("Hub HTTP interface stopped: {e}");
            }
        });

        Ok(Self {
            address,
            cancellation_token,
            handle,
        })
    }

    /// Returns the bound address.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stops the server, waiting for the open connections to complete.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.handle.await {
            error!("Failed to await the hub HTTP interface: {e}");
        }
    }
}
