use std::collections::HashMap;
use std::time::Duration;

use hdrhistogram::Histogram;
use karga::{Aggregate, Metric, Report};
use serde::{Deserialize, Serialize};

// Three significant figures over nanoseconds, up to an hour.
const HIST_MAX_NANOS: u64 = 3_600_000_000_000;
const HIST_SIGFIG: u8 = 3;

#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub struct HttpResponseMetric {
    pub latency: Duration,
    pub status_code: u16,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One request as seen by a virtual user. Requests that never got an answer carry no latency.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub enum HttpMetric {
    Success(HttpResponseMetric),
    Failure,
}

impl Metric for HttpMetric {}

/// Per-user running totals, merged into a single aggregate once the user retires.
#[derive(Clone)]
pub struct HttpAggregate {
    pub latency_hist: Histogram<u64>,
    pub status_count: HashMap<u16, u64>,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub count: u64,
    pub failure_count: u64,
}

impl Aggregate for HttpAggregate {
    type Metric = HttpMetric;

    fn new() -> Self {
        Self {
            latency_hist: Histogram::new_with_bounds(1, HIST_MAX_NANOS, HIST_SIGFIG)
                .expect("static histogram bounds are valid"),
            status_count: HashMap::new(),
            total_bytes_sent: 0,
            total_bytes_received: 0,
            count: 0,
            failure_count: 0,
        }
    }

    fn consume(&mut self, metric: &Self::Metric) {
        match metric {
            HttpMetric::Success(metric) => {
                let nanos = (metric.latency.as_nanos() as u64).max(1);
                if let Err(err) = self.latency_hist.record(nanos) {
                    tracing::warn!("Dropping latency sample: {err}");
                }
                *self.status_count.entry(metric.status_code).or_default() += 1;
                self.total_bytes_sent += metric.bytes_sent;
                self.total_bytes_received += metric.bytes_received;
            }
            HttpMetric::Failure => self.failure_count += 1,
        };
        self.count += 1;
    }

    fn merge(&mut self, other: Self) {
        if let Err(err) = self.latency_hist.add(&other.latency_hist) {
            tracing::warn!("Dropping merged latency samples: {err}");
        }

        for (status_code, other_count) in other.status_count {
            *self.status_count.entry(status_code).or_default() += other_count;
        }
        self.total_bytes_sent += other.total_bytes_sent;
        self.total_bytes_received += other.total_bytes_received;
        self.failure_count += other.failure_count;
        self.count += other.count;
    }
}

impl Default for HttpAggregate {
    fn default() -> Self {
        <Self as Aggregate>::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpLatencyStats {
    pub avg: Duration,
    pub min: Duration,
    pub med: Duration,
    pub max: Duration,
    pub p90: Duration,
    pub p95: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpReport {
    pub req_duration: HttpLatencyStats,
    pub reqs_total: u64,
    /// Percentage of requests that never got a response.
    pub req_failure_ratio: f64,
    pub status_codes: HashMap<u16, u64>,
    pub data_sent: u64,
    pub data_received: u64,
}

impl From<HttpAggregate> for HttpReport {
    fn from(value: HttpAggregate) -> Self {
        let hist = &value.latency_hist;
        let req_duration = if hist.len() == 0 {
            HttpLatencyStats::default()
        } else {
            HttpLatencyStats {
                avg: Duration::from_nanos(hist.mean() as u64),
                min: Duration::from_nanos(hist.min()),
                med: Duration::from_nanos(hist.value_at_quantile(0.5)),
                max: Duration::from_nanos(hist.max()),
                p90: Duration::from_nanos(hist.value_at_quantile(0.90)),
                p95: Duration::from_nanos(hist.value_at_quantile(0.95)),
            }
        };

        let req_failure_ratio = if value.count == 0 {
            0.0
        } else {
            (value.failure_count as f64 / value.count as f64) * 100.0
        };

        Self {
            req_duration,
            reqs_total: value.count,
            req_failure_ratio,
            status_codes: value.status_count,
            data_sent: value.total_bytes_sent,
            data_received: value.total_bytes_received,
        }
    }
}

impl Report<HttpAggregate> for HttpReport {}
