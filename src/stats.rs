use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the control loop. Relaxed ordering; values are only
/// read for reporting.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub ticks: AtomicU64,
    pub frames: AtomicU64,
    pub detections: AtomicU64,
    pub dispatches: AtomicU64,
    pub overruns: AtomicU64,
    pub detector_failures: AtomicU64,
    pub driver_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub frames: u64,
    pub detections: u64,
    pub dispatches: u64,
    pub overruns: u64,
    pub detector_failures: u64,
    pub driver_errors: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            driver_errors: self.driver_errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ticks={} frames={} detections={} dispatched={} overruns={} detector_failures={} driver_errors={}",
            self.ticks,
            self.frames,
            self.detections,
            self.dispatches,
            self.overruns,
            self.detector_failures,
            self.driver_errors
        )
    }
}
