use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Client, StatusCode, Url};

use serde_json::{Map, Value};

use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::credential::{Credential, CredentialStore};
use crate::error::{Error, ErrorKind, Result};
use crate::response::Response;

fn delivery_error(description: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Delivery, description)
}

// Outcome of a single attempt.
enum Attempt {
    Delivered(Response),
    // The credential has been rejected or cannot be sent.
    Unauthorized(String),
    Failed(Error),
}

/// An authenticated client for the server.
///
/// Every request carries the current bearer token. When the server rejects
/// the token, the client refreshes it and sends the request again, for at
/// most `retry_budget` attempts per request.
#[derive(Debug, Clone)]
pub struct ServerClient {
    http: Client,
    base_url: Url,
    records_endpoint: String,
    devices_endpoint: String,
    retry_budget: u32,
    credentials: Arc<CredentialStore>,
}

impl ServerClient {
    /// Creates a [`ServerClient`] sharing the given [`CredentialStore`].
    ///
    /// # Errors
    ///
    /// An error is returned when the server address is not valid or the
    /// `HTTP` client cannot be built.
    pub fn new(config: &ServerConfig, credentials: Arc<CredentialStore>) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            http,
            base_url: config.base_url()?,
            records_endpoint: config.records_endpoint.clone(),
            devices_endpoint: config.devices_endpoint.clone(),
            retry_budget: config.retry_budget.max(1),
            credentials,
        })
    }

    /// Sends a device record to the server.
    ///
    /// # Errors
    ///
    /// See [`Self::post`].
    pub async fn send_record(
        &self,
        device_id: &str,
        record: &Map<String, Value>,
    ) -> Result<Response> {
        let url = self.url(&self.records_endpoint, &[device_id])?;
        self.post(url, Some(record), &[]).await
    }

    /// Notifies the server that a device went online or offline.
    ///
    /// # Errors
    ///
    /// See [`Self::post`].
    pub async fn toggle_device(&self, device_id: &str, is_online: bool) -> Result<Response> {
        let url = self.url(&self.devices_endpoint, &[device_id, "toggle"])?;
        let is_online = if is_online { "true" } else { "false" };
        self.post(url, None, &[("is_online", is_online)]).await
    }

    /// Sends a `POST` request with an optional `JSON` body and query
    /// parameters.
    ///
    /// # Errors
    ///
    /// - An authentication error when a refresh of the credential fails.
    /// - A delivery error when the server answers with a non-success status,
    ///   cannot be reached, or keeps rejecting the credential until the
    ///   retry budget is exhausted.
    pub async fn post(
        &self,
        mut url: Url,
        body: Option<&Map<String, Value>>,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        if !query.is_empty() {
            let _ = url.query_pairs_mut().extend_pairs(query);
        }

        let mut credential = self.credentials.get().await;
        if credential.is_empty() {
            credential = self.credentials.refresh_stale(&credential).await?;
        }

        let mut remaining = self.retry_budget;
        loop {
            remaining -= 1;

            let reason = match self.attempt(&url, body, &credential).await {
                Attempt::Delivered(response) => return Ok(response),
                Attempt::Failed(e) => return Err(e),
                Attempt::Unauthorized(reason) => reason,
            };

            if remaining == 0 {
                error!(
                    "Giving up on `{url}` after {} attempts: {reason}",
                    self.retry_budget
                );
                return Err(delivery_error(format!(
                    "Credential rejected by `{url}` after {} attempts",
                    self.retry_budget
                )));
            }

            warn!("Refreshing credential for `{url}`: {reason}");
            credential = self.credentials.refresh_stale(&credential).await?;
        }
    }

    async fn attempt(
        &self,
        url: &Url,
        body: Option<&Map<String, Value>>,
        credential: &Credential,
    ) -> Attempt {
        let Ok(authorization) = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
        else {
            return Attempt::Unauthorized("the credential is not a valid header value".into());
        };

        let mut request = self
            .http
            .post(url.clone())
            .header(AUTHORIZATION, authorization);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Request to `{url}` failed: {e}");
                return Attempt::Failed(delivery_error(format!(
                    "Request to `{url}` failed: {e}"
                )));
            }
        };

        match response.status() {
            status if status.is_success() => {
                debug!("`{url}` answered with status {status}");
                Attempt::Delivered(Response::new(response))
            }
            StatusCode::UNAUTHORIZED => {
                Attempt::Unauthorized("the server answered with status 401".into())
            }
            status => {
                error!("`{url}` answered with status {status}");
                Attempt::Failed(delivery_error(format!(
                    "`{url}` answered with status {status}"
                )))
            }
        }
    }

    fn url(&self, endpoint: &str, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.join(endpoint).map_err(|e| {
            Error::new(
                ErrorKind::Config,
                format!("Invalid endpoint `{endpoint}`: {e}"),
            )
        })?;

        let _ = url
            .path_segments_mut()
            .map_err(|()| delivery_error(format!("`{endpoint}` cannot have path segments")))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }
}
