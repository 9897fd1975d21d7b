use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{PresenceQuery, UsersPresencePayload},
};
use url::Url;

use crate::{error::PresenceError, transport::PresenceFetcher};

const PRESENCE_PATH: &str = "api/v1/users.presence";

/// Resolves presence in batches through `GET /api/v1/users.presence?ids=a,b`.
pub struct HttpPresenceFetcher {
    http: Client,
    endpoint: Url,
}

impl HttpPresenceFetcher {
    pub fn new(server_url: &str) -> Result<Self, PresenceError> {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: &str) -> Result<Self, PresenceError> {
        let invalid = || PresenceError::InvalidServerUrl(server_url.to_string());
        let mut base = Url::parse(server_url.trim()).map_err(|_| invalid())?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid());
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join(PRESENCE_PATH).map_err(|_| invalid())?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl PresenceFetcher for HttpPresenceFetcher {
    async fn fetch_presence(&self, ids: &[UserId]) -> Result<UsersPresencePayload> {
        let query = PresenceQuery { ids: ids.to_vec() };
        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[("ids", query.to_query_value())])
            .send()
            .await
            .with_context(|| format!("failed to reach presence endpoint {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = match serde_json::from_str::<ApiError>(&body) {
                Ok(api_error) => PresenceError::Fetch {
                    status: status.as_u16(),
                    code: Some(api_error.code),
                    message: api_error.message,
                },
                Err(_) => PresenceError::Fetch {
                    status: status.as_u16(),
                    code: None,
                    message: body,
                },
            };
            return Err(error.into());
        }

        response
            .json::<UsersPresencePayload>()
            .await
            .context("invalid users.presence response body")
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
