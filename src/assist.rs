use crate::config::AssistConfig;
use crate::geometry::Vec2;
use crate::tracker::TrackedTarget;
use std::time::Instant;

/// Normalized stick axes, each in [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectiveVector {
    pub x: f32,
    pub y: f32,
    pub at: Instant,
}

impl CorrectiveVector {
    pub fn neutral(at: Instant) -> Self {
        Self { x: 0.0, y: 0.0, at }
    }

    pub fn is_neutral(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

/// Lead, dead zone, gain, rate limit, low-pass. A missing target or an offset
/// inside the dead zone releases to neutral at once and clears the history.
#[derive(Debug, Default)]
pub struct AssistController {
    /// Last returned output, the reference for rate limiting and smoothing
    prev: (f32, f32),
}

impl AssistController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.prev = (0.0, 0.0);
    }

    /// Compute this tick's output. `config` must have passed
    /// [`AssistConfig::validate`].
    pub fn compute(&mut self, target: Option<&TrackedTarget>, config: &AssistConfig, now: Instant) -> CorrectiveVector {
        let Some(target) = target else {
            self.reset();
            return CorrectiveVector::neutral(now);
        };

        let offset = aim_offset(target, config);
        if offset.length() < config.dead_zone_radius {
            self.reset();
            return CorrectiveVector::neutral(now);
        }

        let scale = config.sensitivity / config.output_range;
        let desired = (
            (offset.x * scale).clamp(-1.0, 1.0),
            (offset.y * scale).clamp(-1.0, 1.0),
        );

        let limited = (
            rate_limit(self.prev.0, desired.0, config.max_rate_per_tick),
            rate_limit(self.prev.1, desired.1, config.max_rate_per_tick),
        );

        let alpha = config.smoothing_alpha;
        let out = (
            (self.prev.0 + alpha * (limited.0 - self.prev.0)).clamp(-1.0, 1.0),
            (self.prev.1 + alpha * (limited.1 - self.prev.1)).clamp(-1.0, 1.0),
        );
        self.prev = out;

        CorrectiveVector {
            x: out.0,
            y: out.1,
            at: now,
        }
    }
}

fn rate_limit(prev: f32, desired: f32, max_step: f32) -> f32 {
    prev + (desired - prev).clamp(-max_step, max_step)
}

/// Offset the controller would act on, before the dead zone. Exposed for
/// diagnostics.
pub fn aim_offset(target: &TrackedTarget, config: &AssistConfig) -> Vec2 {
    let lead = (target.velocity * config.max_lead_ticks).clamp_length(config.max_lead_distance);
    target.position + lead - config.aim_point
}
