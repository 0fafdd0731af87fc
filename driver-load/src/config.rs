use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::auth::Credentials;
use crate::check::CheckSet;
use crate::client::{ReqwestClient, Url};
use crate::error::ConfigError;
use crate::executor::DEFAULT_TICK;
use crate::scenario::Scenario;
use crate::stage::{Stage, StageSchedule};

pub const ENV_PREFIX: &str = "DRIVER_LOAD_";

/// Settings for one run. Defaults describe the driver listing scenario.
#[derive(Clone, Deserialize, TypedBuilder)]
#[serde(default, deny_unknown_fields)]
pub struct LoadConfig {
    #[builder(default = "http://keycloak.iam".to_owned(), setter(into))]
    pub identity_url: String,

    #[builder(default = "driver".to_owned(), setter(into))]
    pub realm: String,

    #[builder(default = "kong".to_owned(), setter(into))]
    pub client_id: String,

    /// No default; must come from the config file or the environment.
    #[builder(default, setter(strip_option, into))]
    pub client_secret: Option<String>,

    #[builder(default = "maria".to_owned(), setter(into))]
    pub username: String,

    #[builder(default = "maria".to_owned(), setter(into))]
    pub password: String,

    #[builder(default = "http://kong-kong-proxy.kong/api/driver/drivers".to_owned(), setter(into))]
    pub target_url: String,

    #[builder(default = driver_stages())]
    pub stages: Vec<Stage>,

    #[serde(with = "humantime_serde")]
    #[builder(default = DEFAULT_TICK)]
    pub tick: Duration,

    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::ZERO)]
    pub pacing: Duration,

    #[serde(with = "humantime_serde")]
    #[builder(default = Some(Duration::from_secs(60)))]
    pub request_timeout: Option<Duration>,
}

fn driver_stages() -> Vec<Stage> {
    vec![
        Stage::new(0, Duration::from_secs(10)),
        Stage::new(50, Duration::from_secs(60)),
        Stage::new(100, Duration::from_secs(60)),
        Stage::new(200, Duration::from_secs(180)),
    ]
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LoadConfig {
    /// Reads `DRIVER_LOAD_CONFIG` (a JSON file) if set, then applies `DRIVER_LOAD_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(format!("{ENV_PREFIX}{key}")).ok();
        let base = match lookup("CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.overlay(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Invalid {
            key: "CONFIG",
            reason: format!("{}: {err}", path.display()),
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|err| ConfigError::Invalid {
            key: "CONFIG",
            reason: err.to_string(),
        })
    }

    /// Applies overrides from `lookup`, keyed without the `DRIVER_LOAD_` prefix.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let strings = [
            ("IDENTITY_URL", &mut self.identity_url),
            ("REALM", &mut self.realm),
            ("CLIENT_ID", &mut self.client_id),
            ("USERNAME", &mut self.username),
            ("PASSWORD", &mut self.password),
            ("TARGET_URL", &mut self.target_url),
        ];
        for (key, field) in strings {
            if let Some(value) = lookup(key) {
                *field = value;
            }
        }
        if let Some(secret) = lookup("CLIENT_SECRET") {
            self.client_secret = Some(secret);
        }
        if let Some(raw) = lookup("STAGES") {
            self.stages = serde_json::from_str(&raw).map_err(|err| ConfigError::Invalid {
                key: "STAGES",
                reason: err.to_string(),
            })?;
        }
        Ok(self)
    }

    /// Rejects settings that would make the run misbehave rather than fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::Invalid {
                key: "TICK",
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let client_secret = self
            .client_secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("client_secret"))?;
        Ok(Credentials::builder()
            .client_id(self.client_id.as_str())
            .client_secret(client_secret)
            .username(self.username.as_str())
            .password(self.password.as_str())
            .build())
    }

    pub fn schedule(&self) -> StageSchedule {
        StageSchedule::new(self.stages.clone())
    }

    pub fn scenario(&self) -> Result<Scenario, ConfigError> {
        let url = Url::parse(&self.target_url).map_err(|source| ConfigError::Url {
            value: self.target_url.clone(),
            source,
        })?;
        Ok(Scenario::builder()
            .name(format!("{} {}", reqwest::Method::GET, url.path()))
            .url(url)
            .checks(CheckSet::status_ok())
            .pacing(self.pacing)
            .build())
    }

    pub fn http_client(&self) -> Result<ReqwestClient, ConfigError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ConfigError::Client)?;
        let client = ReqwestClient::new(client);
        Ok(match self.request_timeout {
            Some(timeout) => client.with_timeout(timeout),
            None => client,
        })
    }
}
