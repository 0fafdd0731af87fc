use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use driver_load::{
    run_with_client, AuthError, AuthResult, ConfigError, HttpClient, HttpRequest, HttpResponse,
    LoadConfig, RunError, Stage, StageExecutor, StageSchedule, TransportError, UserPool,
    STATUS_200,
};
use reqwest::header::AUTHORIZATION;
use tokio::time::Instant;

const TOKEN: &str = r#"{"access_token":"run-token","token_type":"Bearer","expires_in":300}"#;

#[derive(Debug, PartialEq)]
enum Call {
    Token,
    Target,
}

/// Identity provider and target API in one fake, routed on the request path.
struct FakeServer {
    token_status: u16,
    target_status: AtomicU16,
    latency: Duration,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    wrong_token: AtomicUsize,
}

impl FakeServer {
    fn new(token_status: u16, target_status: u16, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            token_status,
            target_status: AtomicU16::new(target_status),
            latency,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            wrong_token: AtomicUsize::new(0),
        })
    }

    fn count(&self, call: Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }
}

#[async_trait]
impl HttpClient for FakeServer {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if request.url.path().ends_with("/protocol/openid-connect/token") {
            self.calls.lock().unwrap().push(Call::Token);
            return Ok(HttpResponse::new(self.token_status, TOKEN));
        }

        self.calls.lock().unwrap().push(Call::Target);
        let bearer = request.headers.get(AUTHORIZATION).map(|v| v.as_bytes());
        if bearer != Some(&b"Bearer run-token"[..]) {
            self.wrong_token.fetch_add(1, Ordering::SeqCst);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(HttpResponse::new(self.target_status.load(Ordering::SeqCst), "[]"))
    }
}

fn config(stages: Vec<Stage>) -> LoadConfig {
    LoadConfig::builder()
        .identity_url("http://idp.test")
        .client_secret("s3cret")
        .target_url("http://api.test/api/driver/drivers")
        .stages(stages)
        .build()
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

#[tokio::test(start_paused = true)]
async fn driver_stages_run_for_their_total_duration() {
    let server = FakeServer::new(200, 200, secs(1));
    let start = Instant::now();

    let config = LoadConfig::default()
        .overlay(|key| (key == "CLIENT_SECRET").then(|| "s3cret".to_owned()))
        .unwrap();

    let report = run_with_client(server.clone(), &config).await.unwrap();
    let elapsed = start.elapsed();

    // 10s + 60s + 60s + 180s of stages plus at most one request still draining.
    assert!(elapsed >= secs(310), "{elapsed:?}");
    assert!(elapsed <= secs(312), "{elapsed:?}");
    assert!(report.elapsed >= secs(310));

    assert!(report.peak_users <= 200);
    assert!(report.peak_users >= 190);
    assert!(server.max_in_flight.load(Ordering::SeqCst) <= 200);

    let check = report.check(STATUS_200).unwrap();
    assert_eq!(check.passes, report.iterations);
    assert_eq!(check.fails, 0);
    assert!(report.all_checks_passed());
    assert_eq!(report.http.reqs_total, report.iterations);
    assert_eq!(server.count(Call::Target) as u64, report.iterations);
    assert_eq!(server.wrong_token.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn authenticates_once_before_any_user_request() {
    let server = FakeServer::new(200, 200, Duration::from_millis(100));

    let report = run_with_client(
        server.clone(),
        &config(vec![Stage::new(5, secs(1)), Stage::new(5, secs(1))]),
    )
    .await
    .unwrap();

    let calls = server.calls.lock().unwrap();
    assert_eq!(calls.first(), Some(&Call::Token));
    assert_eq!(calls.iter().filter(|c| **c == Call::Token).count(), 1);
    assert!(report.iterations > 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_abort_the_run() {
    let server = FakeServer::new(401, 200, Duration::from_millis(100));

    let err = run_with_client(server.clone(), &config(vec![Stage::new(10, secs(5))]))
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Auth(AuthError::Status { status: 401, .. })));
    assert_eq!(server.count(Call::Token), 1);
    assert_eq!(server.count(Call::Target), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_secret_aborts_before_authenticating() {
    let server = FakeServer::new(200, 200, Duration::from_millis(100));
    let config = LoadConfig::builder()
        .identity_url("http://idp.test")
        .stages(vec![Stage::new(1, secs(1))])
        .build();

    let err = run_with_client(server.clone(), &config).await.unwrap_err();
    assert!(matches!(err, RunError::Config(_)));
    assert!(server.calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_recorded_as_failed_checks() {
    let server = FakeServer::new(200, 500, Duration::from_millis(100));

    let report = run_with_client(server.clone(), &config(vec![Stage::new(2, secs(2))]))
        .await
        .unwrap();

    // Two users, each looping back-to-back on 100ms requests.
    assert!(report.iterations >= 40, "{}", report.iterations);
    let check = report.check(STATUS_200).unwrap();
    assert_eq!(check.passes, 0);
    assert_eq!(check.fails, report.iterations);
    assert!(!report.all_checks_passed());
    assert_eq!(report.http.status_codes[&500], report.iterations);
}

#[tokio::test(start_paused = true)]
async fn lowering_the_target_lets_in_flight_iterations_finish() {
    // Both users start a 3s request at t=0; the target drops to 1 mid-stage and the run
    // ends at 2s, yet both requests must still complete and be recorded.
    let server = FakeServer::new(200, 200, secs(3));
    let start = Instant::now();

    let report = run_with_client(
        server.clone(),
        &config(vec![Stage::new(2, secs(1)), Stage::new(0, secs(1))]),
    )
    .await
    .unwrap();

    assert!(start.elapsed() >= secs(3));
    assert_eq!(report.peak_users, 2);
    assert_eq!(report.iterations, 2);
    assert_eq!(report.check(STATUS_200).unwrap().passes, 2);
    assert_eq!(server.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_follows_ramp_up_and_down() {
    let server = FakeServer::new(200, 200, Duration::from_millis(250));
    let stages = vec![
        Stage::new(0, secs(1)),
        Stage::new(10, secs(5)),
        Stage::new(3, secs(5)),
        Stage::new(6, secs(2)),
    ];
    let schedule = StageSchedule::new(stages.clone());
    let token: AuthResult = serde_json::from_str(TOKEN).unwrap();
    let scenario = config(stages).scenario().unwrap();
    let pool = Arc::new(UserPool::new());
    let executor = StageExecutor::builder()
        .schedule(schedule.clone())
        .pool(pool.clone())
        .build();

    // Ticks and 250ms iterations land on multiples of 50ms; sample halfway between them.
    let start = Instant::now();
    let samples = Arc::new(Mutex::new(Vec::new()));
    let sampler = tokio::spawn({
        let pool = pool.clone();
        let samples = samples.clone();
        async move {
            let mut every = tokio::time::interval_at(
                start + Duration::from_millis(25),
                Duration::from_millis(100),
            );
            loop {
                every.tick().await;
                samples.lock().unwrap().push((start.elapsed(), pool.active()));
            }
        }
    });

    let report = executor
        .exec(server.clone(), Arc::new(token), Arc::new(scenario))
        .await
        .unwrap();
    sampler.abort();

    let samples = samples.lock().unwrap();
    assert!(samples.len() >= 120, "{}", samples.len());
    let slack = Duration::from_millis(10);
    let around = |at: Duration| {
        samples
            .iter()
            .find(|&&(t, _)| t + slack > at && t < at + slack)
            .map(|&(_, active)| active)
            .unwrap()
    };

    let mut ramp_down = Vec::new();
    for &(at, active) in samples.iter() {
        if at < secs(1) {
            assert_eq!(active, 0, "idle stage at {at:?}");
        } else if at < secs(6) {
            // Every admitted user is running; none above the target is.
            assert!(active <= schedule.target_at(at), "{active} users at {at:?}");
            let floor = schedule.target_at(at - Duration::from_millis(150));
            assert!(active >= floor, "{active} users at {at:?}");
        } else if at < secs(11) {
            assert!(active <= 10, "{active} users at {at:?}");
            // The last slot may be filled on the first tick of the ramp-down.
            if at >= Duration::from_millis(6300) {
                ramp_down.push(active);
            }
        } else {
            assert!(active <= 6, "{active} users at {at:?}");
        }
    }
    assert!(
        ramp_down.windows(2).all(|w| w[1] <= w[0]),
        "grew while ramping down: {ramp_down:?}"
    );
    assert_eq!(ramp_down.first(), Some(&10));

    let ramped_up = around(Duration::from_millis(5925));
    assert!((9..=10).contains(&ramped_up), "{ramped_up}");
    // Target reaches 3 at 11s and only rises to 4 at 11.67s; users above it finish their
    // last 250ms request by 11.25s.
    assert_eq!(around(Duration::from_millis(11425)), 3);

    assert_eq!(report.peak_users, 10);
    assert!(server.max_in_flight.load(Ordering::SeqCst) <= 10);
    assert_eq!(report.check(STATUS_200).unwrap().total(), report.iterations);
    assert_eq!(pool.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn retiring_users_skip_the_rest_of_their_pacing() {
    let server = FakeServer::new(200, 200, Duration::from_millis(10));
    let start = Instant::now();

    let config = LoadConfig {
        pacing: secs(30),
        ..config(vec![Stage::new(1, secs(1))])
    };
    let report = run_with_client(server.clone(), &config).await.unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed <= secs(2), "{elapsed:?}");
    assert_eq!(report.iterations, 1);
    assert_eq!(server.count(Call::Target), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_tick_is_rejected_before_authenticating() {
    let server = FakeServer::new(200, 200, Duration::from_millis(10));
    let config = LoadConfig {
        tick: Duration::ZERO,
        ..config(vec![Stage::new(1, secs(1))])
    };

    let err = run_with_client(server.clone(), &config).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Config(ConfigError::Invalid { key: "TICK", .. })
    ));
    assert!(server.calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_schedule_sends_nothing_after_authenticating() {
    let server = FakeServer::new(200, 200, Duration::from_millis(100));

    let report = run_with_client(server.clone(), &config(Vec::new()))
        .await
        .unwrap();

    assert_eq!(report.iterations, 0);
    assert!(report.checks.is_empty());
    assert_eq!(server.count(Call::Token), 1);
    assert_eq!(server.count(Call::Target), 0);
}
