use crate::assist::{AssistController, CorrectiveVector};
use crate::capture::FrameSource;
use crate::config::ConfigHandle;
use crate::detector::{Detection, Detector};
use crate::error::{DriverError, PipelineError};
use crate::mode::{AssistGate, AssistMode, Dispatch};
use crate::stats::PipelineStats;
use crate::tracker::{TrackedTarget, Tracker};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fixed-rate control loop. Nothing in a tick waits on the frame source or
/// the detector.
pub struct Orchestrator {
    frames: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    tracker: Tracker,
    controller: AssistController,
    gate: Arc<AssistGate>,
    config: ConfigHandle,
    stats: Arc<PipelineStats>,
    period: Duration,
    detector_failures: u32,
    debug: bool,
}

/// Result of a single tick, for diagnostics and tests.
#[derive(Debug)]
pub struct TickReport {
    pub mode: AssistMode,
    pub target: Option<TrackedTarget>,
    pub vector: CorrectiveVector,
    pub dispatch: Result<Dispatch, DriverError>,
}

impl Orchestrator {
    pub fn new(
        frames: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        gate: Arc<AssistGate>,
        config: ConfigHandle,
        stats: Arc<PipelineStats>,
        period: Duration,
    ) -> Self {
        Self {
            frames,
            detector,
            tracker: Tracker::new(),
            controller: AssistController::new(),
            gate,
            config,
            stats,
            period,
            detector_failures: 0,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Run one tick at time `now`.
    pub fn tick(&mut self, now: Instant) -> Result<TickReport, PipelineError> {
        PipelineStats::bump(&self.stats.ticks);
        let config = self.config.snapshot();
        let mode = self.gate.mode();

        let target = if mode == AssistMode::Stopped {
            // Pipeline idle: drop whatever frame is waiting and forget the target.
            let _ = self.frames.try_acquire();
            self.tracker.reset();
            None
        } else {
            let detections = self.detect(config.detector_failure_limit)?;
            self.tracker.update(&detections, &config, now)
        };

        let vector = self.controller.compute(target.as_ref(), &config, now);
        let dispatch = self.gate.dispatch(&vector);
        if mode != AssistMode::Active {
            // Output is suppressed, so the next Active tick rate-limits from
            // the neutral stick the device actually holds.
            self.controller.reset();
        }
        match &dispatch {
            Ok(Dispatch::Sent) => PipelineStats::bump(&self.stats.dispatches),
            Ok(_) => {}
            Err(e) => {
                PipelineStats::bump(&self.stats.driver_errors);
                log::error!("Virtual gamepad error: {}", e);
            }
        }

        Ok(TickReport {
            mode,
            target,
            vector,
            dispatch,
        })
    }

    fn detect(&mut self, failure_limit: u32) -> Result<Vec<Detection>, PipelineError> {
        let Some(frame) = self.frames.try_acquire() else {
            return Ok(Vec::new());
        };
        PipelineStats::bump(&self.stats.frames);

        match self.detector.detect(&frame) {
            Ok(detections) => {
                if self.detector_failures > 0 {
                    log::info!("Detector recovered after {} failures", self.detector_failures);
                }
                self.detector_failures = 0;
                PipelineStats::add(&self.stats.detections, detections.len() as u64);
                Ok(detections)
            }
            Err(e) => {
                self.detector_failures += 1;
                PipelineStats::bump(&self.stats.detector_failures);
                if self.detector_failures == 1 {
                    log::warn!("{}", e);
                } else {
                    log::debug!("{} ({} in a row)", e, self.detector_failures);
                }
                if self.detector_failures >= failure_limit {
                    log::error!("Detector failed {} ticks in a row, stopping assist", self.detector_failures);
                    if let Err(e) = self.gate.stop() {
                        log::warn!("{}", e);
                    }
                    return Err(PipelineError::DetectorFailed {
                        failures: self.detector_failures,
                        last: e,
                    });
                }
                Ok(Vec::new())
            }
        }
    }

    /// Tick at the configured period until `quit` returns true. The stick is
    /// centered and the gate stopped before returning.
    pub fn run(&mut self, quit: impl Fn() -> bool) -> Result<(), PipelineError> {
        let mut dbg_tick: u32 = 0;
        let result = loop {
            let tick_start = Instant::now();
            if quit() {
                break Ok(());
            }

            let report = match self.tick(tick_start) {
                Ok(report) => report,
                Err(e) => break Err(e),
            };

            if self.debug {
                dbg_tick += 1;
                if dbg_tick >= 100 {
                    dbg_tick = 0;
                    let (pos, vel, age) = report
                        .target
                        .map(|t| {
                            let age = report.vector.at.saturating_duration_since(t.last_seen);
                            ((t.position.x, t.position.y), (t.velocity.x, t.velocity.y), age)
                        })
                        .unwrap_or(((f32::NAN, f32::NAN), (0.0, 0.0), Duration::ZERO));
                    let out = if report.vector.is_neutral() {
                        "neutral".to_string()
                    } else {
                        format!("{:+.3},{:+.3}", report.vector.x, report.vector.y)
                    };
                    let dispatch = match &report.dispatch {
                        Ok(d) => format!("{:?}", d),
                        Err(_) => "error".to_string(),
                    };
                    eprintln!(
                        "[dbg] {:<7} target({:7.1},{:7.1}) vel({:+5.1},{:+5.1}) seen {:>3}ms ago out({}) {}",
                        report.mode,
                        pos.0,
                        pos.1,
                        vel.0,
                        vel.1,
                        age.as_millis(),
                        out,
                        dispatch,
                    );
                }
            }

            let elapsed = tick_start.elapsed();
            if elapsed < self.period {
                spin_sleep::sleep(self.period - elapsed);
            } else {
                PipelineStats::bump(&self.stats.overruns);
            }
        };

        if self.gate.mode() != AssistMode::Stopped {
            if let Err(e) = self.gate.stop() {
                log::warn!("{}", e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssistConfig;
    use crate::detector::Frame;
    use crate::error::DetectorError;
    use crate::geometry::Vec2;
    use crate::virtual_pad::testing::RecordingSink;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Yields a frame on every call unless `starved` is set.
    struct TestFrames {
        starved: Arc<Mutex<bool>>,
    }

    impl FrameSource for TestFrames {
        fn try_acquire(&mut self) -> Option<Frame> {
            if *self.starved.lock() {
                None
            } else {
                Some(Frame::new(Vec::new(), 0, 0))
            }
        }
    }

    /// Returns queued results, or `fallback` detections when the queue is empty.
    struct ScriptedDetector {
        queue: Arc<Mutex<VecDeque<Result<Vec<Vec2>, String>>>>,
        fallback: Arc<Mutex<Vec<Vec2>>>,
        calls: Arc<AtomicUsize>,
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let next = self
                .queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.lock().clone()));
            next.map(|positions| {
                positions
                    .into_iter()
                    .map(|position| Detection {
                        position,
                        confidence: 0.9,
                        frame_ts: frame.captured_at,
                    })
                    .collect()
            })
            .map_err(DetectorError::Unavailable)
        }
    }

    struct Harness {
        orch: Orchestrator,
        gate: Arc<AssistGate>,
        sink: RecordingSink,
        config: ConfigHandle,
        starved: Arc<Mutex<bool>>,
        queue: Arc<Mutex<VecDeque<Result<Vec<Vec2>, String>>>>,
        fallback: Arc<Mutex<Vec<Vec2>>>,
        calls: Arc<AtomicUsize>,
        stats: Arc<PipelineStats>,
    }

    fn harness(config: AssistConfig) -> Harness {
        let sink = RecordingSink::new();
        let gate = Arc::new(AssistGate::new(Box::new(sink.clone())));
        let config = ConfigHandle::new(config);
        let starved = Arc::new(Mutex::new(false));
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let fallback = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(PipelineStats::new());
        let orch = Orchestrator::new(
            Box::new(TestFrames {
                starved: Arc::clone(&starved),
            }),
            Box::new(ScriptedDetector {
                queue: Arc::clone(&queue),
                fallback: Arc::clone(&fallback),
                calls: Arc::clone(&calls),
            }),
            Arc::clone(&gate),
            config.clone(),
            Arc::clone(&stats),
            Duration::from_millis(1),
        );
        Harness {
            orch,
            gate,
            sink,
            config,
            starved,
            queue,
            fallback,
            calls,
            stats,
        }
    }

    fn scenario_config() -> AssistConfig {
        AssistConfig {
            dead_zone_radius: 10.0,
            sensitivity: 1.0,
            fov_radius: 200.0,
            ..Default::default()
        }
    }

    #[test]
    fn first_active_tick_pushes_toward_target() {
        let mut h = harness(scenario_config());
        let aim = h.config.snapshot().aim_point;
        *h.fallback.lock() = vec![aim + Vec2::new(50.0, 0.0)];
        h.gate.start().unwrap();
        h.gate.enable_mapping().unwrap();

        let report = h.orch.tick(Instant::now()).unwrap();
        assert_eq!(report.dispatch.unwrap(), Dispatch::Sent);
        let (x, y) = h.sink.last().unwrap();
        assert!(x > 0.0 && x <= 1.0);
        assert_eq!(y, 0.0);
    }

    #[test]
    fn enabling_after_long_armed_period_is_rate_limited() {
        let config = scenario_config();
        let max_rate = config.max_rate_per_tick;
        let mut h = harness(config);
        let aim = h.config.snapshot().aim_point;
        *h.fallback.lock() = vec![aim + Vec2::new(190.0, 0.0)];
        h.gate.start().unwrap();
        for _ in 0..30 {
            assert_ne!(h.orch.tick(Instant::now()).unwrap().dispatch.unwrap(), Dispatch::Sent);
        }
        let before = h.sink.last();
        assert_eq!(before, Some((0.0, 0.0)));

        h.gate.enable_mapping().unwrap();
        let report = h.orch.tick(Instant::now()).unwrap();
        assert_eq!(report.dispatch.unwrap(), Dispatch::Sent);
        let (x, y) = h.sink.last().unwrap();
        assert!(x > 0.0 && x <= max_rate, "first step {} exceeds {}", x, max_rate);
        assert_eq!(y, 0.0);

        // Later steps stay within the rate limit too.
        let mut prev = x;
        for _ in 0..10 {
            h.orch.tick(Instant::now()).unwrap();
            let (x, _) = h.sink.last().unwrap();
            assert!((x - prev).abs() <= max_rate + 1e-6);
            prev = x;
        }
    }

    #[test]
    fn stop_then_start_keeps_stick_neutral() {
        let mut h = harness(scenario_config());
        let aim = h.config.snapshot().aim_point;
        *h.fallback.lock() = vec![aim + Vec2::new(80.0, 30.0)];
        h.gate.start().unwrap();
        h.gate.enable_mapping().unwrap();
        for _ in 0..5 {
            h.orch.tick(Instant::now()).unwrap();
        }
        assert_ne!(h.sink.last(), Some((0.0, 0.0)));

        h.gate.stop().unwrap();
        assert_eq!(h.sink.last(), Some((0.0, 0.0)));

        h.gate.start().unwrap();
        for _ in 0..10 {
            let report = h.orch.tick(Instant::now()).unwrap();
            assert!(report.target.is_some());
        }
        assert_eq!(h.sink.last(), Some((0.0, 0.0)));
    }

    #[test]
    fn stopped_pipeline_does_not_detect() {
        let mut h = harness(scenario_config());
        for _ in 0..5 {
            h.orch.tick(Instant::now()).unwrap();
        }
        assert_eq!(h.calls.load(Ordering::Relaxed), 0);
        assert_eq!(h.sink.count(), 0);
    }

    #[test]
    fn missing_frame_skips_detection() {
        let mut h = harness(scenario_config());
        h.gate.start().unwrap();
        *h.starved.lock() = true;
        for _ in 0..3 {
            h.orch.tick(Instant::now()).unwrap();
        }
        assert_eq!(h.calls.load(Ordering::Relaxed), 0);
        *h.starved.lock() = false;
        h.orch.tick(Instant::now()).unwrap();
        assert_eq!(h.calls.load(Ordering::Relaxed), 1);
        assert_eq!(h.stats.snapshot().frames, 1);
    }

    #[test]
    fn transient_detector_failure_is_no_target() {
        let mut h = harness(scenario_config());
        h.gate.start().unwrap();
        h.queue.lock().push_back(Err("model not loaded".into()));
        let report = h.orch.tick(Instant::now()).unwrap();
        assert!(report.target.is_none());
        assert_eq!(h.gate.mode(), AssistMode::Armed);
        assert_eq!(h.stats.snapshot().detector_failures, 1);
    }

    #[test]
    fn persistent_detector_failure_stops() {
        let mut h = harness(AssistConfig {
            detector_failure_limit: 3,
            ..scenario_config()
        });
        h.gate.start().unwrap();
        h.gate.enable_mapping().unwrap();
        for _ in 0..3 {
            h.queue.lock().push_back(Err("gone".into()));
        }
        assert!(h.orch.tick(Instant::now()).is_ok());
        assert!(h.orch.tick(Instant::now()).is_ok());
        let err = h.orch.tick(Instant::now()).unwrap_err();
        assert!(matches!(err, PipelineError::DetectorFailed { failures: 3, .. }));
        assert_eq!(h.gate.mode(), AssistMode::Stopped);
        assert_eq!(h.sink.last(), Some((0.0, 0.0)));
    }

    #[test]
    fn driver_error_drops_to_armed_and_keeps_ticking() {
        let mut h = harness(scenario_config());
        let aim = h.config.snapshot().aim_point;
        *h.fallback.lock() = vec![aim + Vec2::new(60.0, 0.0)];
        h.gate.start().unwrap();
        h.gate.enable_mapping().unwrap();
        h.sink.set_failing(true);

        let report = h.orch.tick(Instant::now()).unwrap();
        assert!(report.dispatch.is_err());
        assert_eq!(h.gate.mode(), AssistMode::Armed);

        h.sink.set_failing(false);
        let report = h.orch.tick(Instant::now()).unwrap();
        assert_eq!(report.dispatch.unwrap(), Dispatch::Neutralized);
        assert!(report.target.is_some());
        assert_eq!(h.stats.snapshot().driver_errors, 1);
    }

    #[test]
    fn config_swap_applies_next_tick() {
        let mut h = harness(scenario_config());
        let aim = h.config.snapshot().aim_point;
        *h.fallback.lock() = vec![aim + Vec2::new(50.0, 0.0)];
        h.gate.start().unwrap();
        h.gate.enable_mapping().unwrap();
        assert!(!h.orch.tick(Instant::now()).unwrap().vector.is_neutral());

        h.config
            .swap(AssistConfig {
                dead_zone_radius: 500.0,
                ..scenario_config()
            })
            .unwrap();
        assert!(h.orch.tick(Instant::now()).unwrap().vector.is_neutral());
    }

    #[test]
    fn run_exits_and_centers_on_quit() {
        let mut h = harness(scenario_config());
        let aim = h.config.snapshot().aim_point;
        *h.fallback.lock() = vec![aim + Vec2::new(70.0, 0.0)];
        h.gate.start().unwrap();
        h.gate.enable_mapping().unwrap();

        let ticks = AtomicUsize::new(0);
        h.orch
            .run(|| ticks.fetch_add(1, Ordering::Relaxed) >= 20)
            .unwrap();
        assert_eq!(h.gate.mode(), AssistMode::Stopped);
        assert_eq!(h.sink.last(), Some((0.0, 0.0)));
        assert_eq!(h.stats.snapshot().ticks, 20);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Start,
        Stop,
        Enable,
        Disable,
        Tick(Vec<(f32, f32)>),
    }

    fn arb_step() -> impl Strategy<Value = Step> {
        prop_oneof![
            1 => Just(Step::Start),
            1 => Just(Step::Stop),
            1 => Just(Step::Enable),
            1 => Just(Step::Disable),
            6 => prop::collection::vec((-250.0f32..250.0, -250.0f32..250.0), 0..3).prop_map(Step::Tick),
        ]
    }

    proptest! {
        #[test]
        fn prop_adapter_sees_output_only_while_active(steps in prop::collection::vec(arb_step(), 1..60)) {
            let mut h = harness(scenario_config());
            let aim = h.config.snapshot().aim_point;
            for step in steps {
                let before = h.sink.count();
                match step {
                    Step::Start => { let _ = h.gate.start(); }
                    Step::Stop => { let _ = h.gate.stop(); }
                    Step::Enable => { let _ = h.gate.enable_mapping(); }
                    Step::Disable => { let _ = h.gate.disable_mapping(); }
                    Step::Tick(offsets) => {
                        *h.fallback.lock() = offsets.iter().map(|&(x, y)| aim + Vec2::new(x, y)).collect();
                        let mode = h.gate.mode();
                        h.orch.tick(Instant::now()).unwrap();
                        let submitted = h.sink.submitted.lock();
                        if mode != AssistMode::Active {
                            prop_assert!(submitted[before..].iter().all(|&s| s == (0.0, 0.0)));
                        }
                    }
                }
                let submitted = h.sink.submitted.lock();
                if h.gate.mode() != AssistMode::Active {
                    if let Some(&last) = submitted.last() {
                        if submitted.len() > before {
                            prop_assert_eq!(last, (0.0, 0.0));
                        }
                    }
                }
            }
        }
    }
}
