use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::client::{HttpClient, HttpRequest, Url};
use crate::error::{AuthError, ConfigError};

#[derive(Clone, TypedBuilder)]
pub struct Credentials {
    #[builder(setter(into))]
    pub client_id: String,
    #[builder(setter(into))]
    pub client_secret: String,
    #[builder(setter(into))]
    pub username: String,
    #[builder(setter(into))]
    pub password: String,
}

// Keep secrets out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Token endpoint response. Only `access_token` is required, everything else is carried along.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthResult {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub refresh_expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl AuthResult {
    pub fn bearer_header(&self) -> Result<HeaderValue, AuthError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.access_token))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

pub fn token_url(base: &str, realm: &str) -> Result<Url, ConfigError> {
    let value = format!(
        "{}/realms/{realm}/protocol/openid-connect/token",
        base.trim_end_matches('/')
    );
    Url::parse(&value).map_err(|source| ConfigError::Url { value, source })
}

pub struct Authenticator<C> {
    client: Arc<C>,
    token_url: Url,
}

impl<C: HttpClient> Authenticator<C> {
    pub fn new(client: Arc<C>, token_url: Url) -> Self {
        Self { client, token_url }
    }

    /// Exchanges user credentials for a token with the password grant.
    #[tracing::instrument(skip_all, fields(url = %self.token_url, client_id = %credentials.client_id))]
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<AuthResult, AuthError> {
        let request = HttpRequest::post(self.token_url.clone()).form([
            ("client_id", credentials.client_id.as_str()),
            ("grant_type", "password"),
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("scope", "openid"),
        ]);

        let res = self.client.execute(request).await?;
        if !res.is_success() {
            return Err(AuthError::Status {
                status: res.status,
                body: res.text(),
            });
        }

        let token: AuthResult = res.json()?;
        tracing::info!(
            token_type = token.token_type.as_deref().unwrap_or("unknown"),
            expires_in = token.expires_in,
            "Obtained access token"
        );
        Ok(token)
    }
}
