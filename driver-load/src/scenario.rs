use std::time::Duration;

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use typed_builder::TypedBuilder;

use crate::check::CheckSet;
use crate::client::{Headers, HttpRequest, Method, Url, APPLICATION_JSON};

/// What each virtual user does per iteration: one authenticated request, then the checks.
#[derive(Debug, TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,

    #[builder(default = Method::GET)]
    pub method: Method,

    pub url: Url,

    /// Sent on top of `Content-Type` and `Authorization`.
    #[builder(default)]
    pub headers: Headers,

    #[builder(default = CheckSet::status_ok())]
    pub checks: CheckSet,

    /// Pause after every iteration. Zero only yields to the scheduler.
    #[builder(default = Duration::ZERO)]
    pub pacing: Duration,
}

impl Scenario {
    pub fn request(&self, bearer: &HeaderValue) -> HttpRequest {
        HttpRequest::new(self.method.clone(), self.url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON))
            .headers(&self.headers)
            .bearer_auth(bearer.clone())
    }
}
