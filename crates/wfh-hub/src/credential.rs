use std::sync::Arc;

use reqwest::{Client, Url};

use serde::Deserialize;

use tokio::sync::{Mutex, RwLock};

use tracing::{error, info};

use crate::config::ServerConfig;
use crate::error::{Error, ErrorKind, Result};

fn auth_error(description: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Auth, description)
}

/// A bearer token issued by the server.
///
/// Its expiry is unknown to the hub: a token is considered expired only when
/// the server rejects it. A [`Credential`] is never modified, a refresh
/// produces a new one.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: Arc<str>,
    // Incremented at every replacement.
    generation: u64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("generation", &self.generation)
            .finish()
    }
}

impl Credential {
    /// Creates a [`Credential`] from a token.
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            token: Arc::from(token),
            generation: 0,
        }
    }

    /// Returns the bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether no token has been obtained yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    fn replace(&self, token: &str) -> Self {
        Self {
            token: Arc::from(token),
            generation: self.generation.wrapping_add(1),
        }
    }
}

/// User credentials exchanged for a [`Credential`].
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct UserCredentials {
    /// User e-mail, sent as username.
    pub email: String,
    /// User password.
    pub password: String,
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl UserCredentials {
    /// Creates [`UserCredentials`].
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// The holder of the current [`Credential`].
///
/// Reads are shared. Refreshes are serialized, and a refresh requested for a
/// credential that has already been replaced returns the replacement without
/// contacting the server again.
#[derive(Debug)]
pub struct CredentialStore {
    http: Client,
    auth_url: Url,
    user: RwLock<UserCredentials>,
    credential: RwLock<Credential>,
    refresh_lock: Mutex<()>,
}

impl CredentialStore {
    /// Creates a [`CredentialStore`] without any token.
    ///
    /// # Errors
    ///
    /// An error is returned when the authentication `URL` is not valid or
    /// the `HTTP` client cannot be built.
    pub fn new(config: &ServerConfig, user: UserCredentials) -> Result<Self> {
        let auth_url = config.base_url()?.join(&config.auth_endpoint).map_err(|e| {
            Error::new(
                ErrorKind::Config,
                format!("Invalid auth endpoint `{}`: {e}", config.auth_endpoint),
            )
        })?;

        let http = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            http,
            auth_url,
            user: RwLock::new(user),
            credential: RwLock::new(Credential::new("")),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Seeds the store with an already issued token.
    #[must_use]
    pub fn with_token(self, token: &str) -> Self {
        Self {
            credential: RwLock::new(Credential::new(token)),
            ..self
        }
    }

    /// Returns the current [`Credential`].
    pub async fn get(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// Replaces the user credentials used by the next refresh.
    pub async fn update_user_credentials(&self, user: UserCredentials) {
        *self.user.write().await = user;
        info!("User credentials updated");
    }

    /// Exchanges the user credentials for a new [`Credential`] and stores it.
    ///
    /// # Errors
    ///
    /// An error is returned when the server is unreachable, rejects the user
    /// credentials or answers with an unexpected body. The held credential is
    /// left untouched.
    pub async fn refresh(&self) -> Result<Credential> {
        let _guard = self.refresh_lock.lock().await;
        self.exchange().await
    }

    /// Refreshes the credential only if `stale` is still the current one.
    ///
    /// Concurrent callers holding the same stale credential observe the
    /// outcome of a single exchange.
    ///
    /// # Errors
    ///
    /// Same as [`Self::refresh`].
    pub async fn refresh_stale(&self, stale: &Credential) -> Result<Credential> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.get().await;
        if current.generation != stale.generation {
            return Ok(current);
        }

        self.exchange().await
    }

    // Must be called with the refresh lock held.
    async fn exchange(&self) -> Result<Credential> {
        let user = self.user.read().await.clone();

        let token = match self.authenticate(&user).await {
            Ok(token) => token,
            Err(e) => {
                error!("Credential refresh for `{}` failed: {e}", user.email);
                return Err(e);
            }
        };

        let mut credential = self.credential.write().await;
        *credential = credential.replace(&token);
        info!("Credential refreshed for `{}`", user.email);

        Ok(credential.clone())
    }

    async fn authenticate(&self, user: &UserCredentials) -> Result<String> {
        let response = self
            .http
            .post(self.auth_url.clone())
            .form(&[
                ("username", user.email.as_str()),
                ("password", user.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| auth_error(format!("Authentication request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(auth_error(format!(
                "Authentication rejected with status {status}"
            )));
        }

        let body = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| auth_error(format!("Invalid authentication response: {e}")))?;

        Ok(body.access_token)
    }
}
