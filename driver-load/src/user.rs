use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use karga::Aggregate;
use reqwest::header::HeaderValue;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::auth::AuthResult;
use crate::check::CheckRecorder;
use crate::client::{HttpClient, HttpResponse};
use crate::metrics::{HttpAggregate, HttpMetric, HttpResponseMetric};
use crate::scenario::Scenario;

/// Concurrency target published by the scheduler and polled by users between iterations.
///
/// A pool belongs to a single run; its counters are never reset.
#[derive(Debug, Default)]
pub struct UserPool {
    target: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    iterations: AtomicU64,
    changed: Notify,
}

impl UserPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_target(&self, target: usize) {
        if self.target.swap(target, Ordering::AcqRel) != target {
            self.changed.notify_waiters();
        }
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    /// Users are indexed from zero; a lower target retires the highest indices first.
    pub fn admits(&self, index: usize) -> bool {
        index < self.target()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Acquire)
    }

    /// Resolves once `index` is no longer admitted.
    pub async fn retired(&self, index: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.admits(index) {
                return;
            }
            notified.await;
        }
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        ActiveGuard(self)
    }
}

struct ActiveGuard<'a>(&'a UserPool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything the users of one run share. The token is fixed for the whole run.
pub struct UserContext<C> {
    pub client: Arc<C>,
    /// Obtained once before any user starts and never replaced.
    pub token: Arc<AuthResult>,
    /// `Authorization` value derived from `token`, encoded once per run.
    pub bearer: HeaderValue,
    pub scenario: Arc<Scenario>,
    pub recorder: Arc<CheckRecorder>,
    pub pool: Arc<UserPool>,
}

pub struct VirtualUser<C> {
    index: usize,
    ctx: Arc<UserContext<C>>,
}

impl<C: HttpClient> VirtualUser<C> {
    pub fn new(index: usize, ctx: Arc<UserContext<C>>) -> Self {
        Self { index, ctx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Iterates until the pool target drops to or below this user's index.
    /// An iteration in flight always completes and is recorded before the user returns;
    /// a pacing pause is cut short as soon as the user is retired.
    pub async fn run(self) -> HttpAggregate {
        let pool = self.ctx.pool.clone();
        let _active = pool.enter();
        let mut aggregate = HttpAggregate::new();

        tracing::trace!(user = self.index, "Virtual user started");
        while pool.admits(self.index) {
            let metric = self.iterate().await;
            aggregate.consume(&metric);
            if !pool.admits(self.index) {
                break;
            }

            let pacing = self.ctx.scenario.pacing;
            if pacing.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(pacing) => {}
                    _ = pool.retired(self.index) => {}
                }
            }
        }
        tracing::trace!(user = self.index, requests = aggregate.count, "Virtual user retired");

        aggregate
    }

    /// One request plus its checks. Failures are recorded, never returned.
    pub async fn iterate(&self) -> HttpMetric {
        let ctx = &self.ctx;
        let request = ctx.scenario.request(&ctx.bearer);
        let bytes_sent = request.body_len();

        let start = Instant::now();
        let res = ctx.client.execute(request).await;
        let latency = start.elapsed();

        let (response, metric) = match res {
            Ok(response) => {
                let metric = HttpMetric::Success(HttpResponseMetric {
                    latency,
                    status_code: response.status,
                    bytes_sent,
                    bytes_received: response.body.len() as u64,
                });
                (response, metric)
            }
            Err(err) => {
                tracing::debug!(user = self.index, "Request failed: {err}");
                (HttpResponse::transport_failure(), HttpMetric::Failure)
            }
        };

        ctx.recorder.record(&response, &ctx.scenario.checks);
        ctx.pool.iterations.fetch_add(1, Ordering::AcqRel);
        metric
    }
}
