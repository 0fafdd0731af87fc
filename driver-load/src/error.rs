use thiserror::Error;

/// The request never produced a response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token request failed")]
    Transport(#[from] TransportError),
    #[error("identity provider answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("token response is not usable: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("access token cannot be sent as a header value")]
    InvalidToken(#[from] reqwest::header::InvalidHeaderValue),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url `{value}`")]
    Url {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("unable to build http client")]
    Client(#[source] reqwest::Error),
}

/// Fatal errors; any of these stops the run before a virtual user starts.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("authentication failed, aborting run")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
