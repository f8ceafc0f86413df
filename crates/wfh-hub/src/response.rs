use reqwest::{Response as ReqwestResponse, StatusCode};

use serde::de::DeserializeOwned;

use crate::error::{Error, ErrorKind, Result};

/// A successful response returned by the server.
#[derive(Debug)]
pub struct Response(ReqwestResponse);

impl Response {
    /// Returns the response status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.0.status()
    }

    /// Parses the response body as `JSON`.
    ///
    /// # Errors
    ///
    /// If the response body is not a valid `T`, a parsing error will be
    /// raised. This may occur due to an incorrect format or because the
    /// binary data contains syntactic or semantic errors.
    pub async fn parse_body<T: DeserializeOwned>(self) -> Result<T> {
        self.0
            .json::<T>()
            .await
            .map_err(|e| Error::new(ErrorKind::Delivery, format!("Json error caused by {e}")))
    }

    pub(crate) const fn new(response: ReqwestResponse) -> Self {
        Self(response)
    }
}
