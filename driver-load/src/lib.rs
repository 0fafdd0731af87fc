//! Staged virtual-user load scenario.
//!
//! Authenticates once against a Keycloak realm with the password grant, then ramps
//! virtual users through a list of stages. Every user repeatedly sends an authenticated
//! `GET` to the target and records the configured checks against the response.

pub mod auth;
pub mod check;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod scenario;
pub mod stage;
pub mod user;

pub use auth::{AuthResult, Authenticator, Credentials};
pub use check::{CheckRecorder, CheckResult, CheckSet, CheckSummary, STATUS_200};
pub use client::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use config::LoadConfig;
pub use error::{AuthError, ConfigError, RunError, TransportError};
pub use executor::{run, run_with_client, RunReport, StageExecutor};
pub use metrics::{HttpAggregate, HttpMetric, HttpReport};
pub use scenario::Scenario;
pub use stage::{Stage, StageSchedule};
pub use user::{UserContext, UserPool, VirtualUser};
