use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One ramp segment: reach `target` concurrent users by the end of `duration`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub target: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Stage {
    pub const fn new(target: usize, duration: Duration) -> Self {
        Self { target, duration }
    }
}

/// Immutable list of stages turned into a target-concurrency function of elapsed time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSchedule {
    start: usize,
    stages: Vec<Stage>,
}

impl StageSchedule {
    /// Starts at the first stage's target.
    pub fn new(stages: Vec<Stage>) -> Self {
        let start = stages.first().map_or(0, |s| s.target);
        Self::with_start(start, stages)
    }

    pub fn with_start(start: usize, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn peak_target(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, usize::max)
    }

    /// Index of the stage running at `elapsed`, `None` once every stage is over.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (i, stage) in self.stages.iter().enumerate() {
            stage_end += stage.duration;
            if elapsed < stage_end {
                return Some(i);
            }
        }
        None
    }

    /// Linear ramp from the previous target to the current stage's target.
    ///
    /// The step is rounded toward the previous target, so the value never leaves
    /// `[min(prev, cur), max(prev, cur)]` and only reaches `cur` at the stage's end.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut prev = self.start;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let into = (elapsed - stage_start).as_nanos();
                let span = stage.duration.as_nanos();
                let diff = prev.abs_diff(stage.target) as u128;
                let step = (diff * into / span) as usize;
                return if stage.target >= prev {
                    prev + step
                } else {
                    prev - step
                };
            }
            stage_start = stage_end;
            prev = stage.target;
        }
        prev
    }
}
