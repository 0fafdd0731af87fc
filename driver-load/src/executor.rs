use std::sync::Arc;
use std::time::Duration;

use karga::Aggregate;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::auth::{self, AuthResult, Authenticator};
use crate::check::{CheckRecorder, CheckSummary};
use crate::client::{HttpClient, ReqwestClient};
use crate::config::LoadConfig;
use crate::error::RunError;
use crate::metrics::{HttpAggregate, HttpReport};
use crate::scenario::Scenario;
use crate::stage::StageSchedule;
use crate::user::{UserContext, UserPool, VirtualUser};

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: String,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub iterations: u64,
    pub peak_users: usize,
    pub checks: Vec<CheckSummary>,
    pub http: HttpReport,
}

impl RunReport {
    pub fn check(&self, name: &str) -> Option<&CheckSummary> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn all_checks_passed(&self) -> bool {
        self.checks.iter().all(|c| c.fails == 0)
    }
}

/// Ramps virtual users through a [`StageSchedule`].
///
/// Every `tick` the current target is published to the user pool and vacant user slots
/// below it are filled. Users above the target retire on their own after their current
/// iteration. Once the schedule is over the target drops to zero and the executor waits
/// for every user to finish.
#[derive(Debug, TypedBuilder)]
pub struct StageExecutor {
    schedule: StageSchedule,

    #[builder(default = DEFAULT_TICK)]
    tick: Duration,

    /// Live view of the run's users; pass one in to observe it while `exec` runs.
    #[builder(default)]
    pool: Arc<UserPool>,
}

impl StageExecutor {
    pub fn schedule(&self) -> &StageSchedule {
        &self.schedule
    }

    pub fn pool(&self) -> &Arc<UserPool> {
        &self.pool
    }

    pub async fn exec<C: HttpClient>(
        &self,
        client: Arc<C>,
        token: Arc<AuthResult>,
        scenario: Arc<Scenario>,
    ) -> Result<RunReport, RunError> {
        let ctx = Arc::new(UserContext {
            client,
            bearer: token.bearer_header()?,
            token,
            scenario,
            recorder: Arc::new(CheckRecorder::new()),
            pool: self.pool.clone(),
        });

        let total = self.schedule.total_duration();
        let tick = self.tick.max(MIN_TICK);
        if let Some(lifetime) = ctx.token.expires_in.map(Duration::from_secs) {
            if lifetime < total {
                tracing::warn!(
                    expires_in = ?lifetime,
                    duration = ?total,
                    "Access token expires before the run ends, later requests will fail their checks"
                );
            }
        }
        tracing::info!(
            scenario = %ctx.scenario.name,
            stages = self.schedule.stages().len(),
            duration = ?total,
            max_users = self.schedule.peak_target(),
            "Starting run"
        );

        let start = Instant::now();
        let mut slots: Vec<Option<JoinHandle<HttpAggregate>>> = Vec::new();
        let mut results = HttpAggregate::new();
        let mut current_stage = None;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= total {
                break;
            }

            let stage_index = self.schedule.stage_index_at(elapsed);
            if stage_index != current_stage {
                if let Some(stage) = stage_index.map(|i| self.schedule.stages()[i]) {
                    tracing::info!(
                        stage = stage_index,
                        target = stage.target,
                        duration = ?stage.duration,
                        active = ctx.pool.active(),
                        "Entering stage"
                    );
                }
                current_stage = stage_index;
            }

            let target = self.schedule.target_at(elapsed);
            ctx.pool.set_target(target);
            if slots.len() < target {
                slots.resize_with(target, || None);
            }

            for (index, slot) in slots.iter_mut().enumerate() {
                if slot.as_ref().is_some_and(|h| h.is_finished()) {
                    if let Some(handle) = slot.take() {
                        collect(handle, &mut results).await;
                    }
                }
                if index < target && slot.is_none() {
                    let user = VirtualUser::new(index, ctx.clone());
                    *slot = Some(tokio::spawn(user.run()));
                }
            }

            tokio::time::sleep(tick.min(total - elapsed)).await;
        }

        ctx.pool.set_target(0);
        tracing::info!(
            active = ctx.pool.active(),
            "All stages complete, waiting for in-flight iterations"
        );
        for handle in slots.into_iter().flatten() {
            collect(handle, &mut results).await;
        }

        let report = RunReport {
            scenario: ctx.scenario.name.clone(),
            elapsed: start.elapsed(),
            iterations: ctx.pool.iterations(),
            peak_users: ctx.pool.peak(),
            checks: ctx.recorder.summaries(),
            http: HttpReport::from(results),
        };
        tracing::info!(
            elapsed = ?report.elapsed,
            iterations = report.iterations,
            peak_users = report.peak_users,
            "Run finished"
        );
        Ok(report)
    }
}

async fn collect(handle: JoinHandle<HttpAggregate>, results: &mut HttpAggregate) {
    match handle.await {
        Ok(aggregate) => results.merge(aggregate),
        Err(err) => tracing::error!("Virtual user task failed: {err}"),
    }
}

/// Runs the configured scenario against the real network.
pub async fn run(config: &LoadConfig) -> Result<RunReport, RunError> {
    let client = Arc::new(config.http_client()?);
    run_with_client::<ReqwestClient>(client, config).await
}

/// Authenticates once, then drives the stages. Nothing is sent to the target if
/// authentication fails.
pub async fn run_with_client<C: HttpClient>(
    client: Arc<C>,
    config: &LoadConfig,
) -> Result<RunReport, RunError> {
    config.validate()?;
    let token_url = auth::token_url(&config.identity_url, &config.realm)?;
    let credentials = config.credentials()?;
    let scenario = Arc::new(config.scenario()?);

    let token = Authenticator::new(client.clone(), token_url)
        .authenticate(&credentials)
        .await?;

    StageExecutor::builder()
        .schedule(config.schedule())
        .tick(config.tick)
        .build()
        .exec(client, Arc::new(token), scenario)
        .await
}
