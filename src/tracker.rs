use crate::config::AssistConfig;
use crate::detector::Detection;
use crate::geometry::Vec2;
use std::cmp::Ordering;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedTarget {
    pub position: Vec2,
    /// Pixels per tick
    pub velocity: Vec2,
    pub last_seen: Instant,
    /// Consecutive ticks without a qualifying detection
    pub staleness: u32,
}

/// Follows the best detection inside the field of view and drops it after
/// too many ticks unseen.
#[derive(Debug, Default)]
pub struct Tracker {
    target: Option<TrackedTarget>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.target = None;
    }

    /// Feed one tick's detections (possibly none) and return the tracked target.
    pub fn update(&mut self, detections: &[Detection], config: &AssistConfig, now: Instant) -> Option<TrackedTarget> {
        let Some(best) = select(detections, config.aim_point, config.fov_radius) else {
            if let Some(target) = self.target.as_mut() {
                target.staleness = target.staleness.saturating_add(1);
                if target.staleness > config.staleness_threshold {
                    log::debug!("Target lost after {} ticks", target.staleness);
                    self.target = None;
                }
            }
            return self.target;
        };

        log::trace!(
            "Detection at ({:.1}, {:.1}), frame age {:?}",
            best.position.x,
            best.position.y,
            now.saturating_duration_since(best.frame_ts)
        );
        self.target = Some(match self.target {
            None => TrackedTarget {
                position: best.position,
                velocity: Vec2::ZERO,
                last_seen: now,
                staleness: 0,
            },
            Some(prev) => {
                let position = prev.position + (best.position - prev.position) * config.tracking_alpha;
                let ticks = prev.staleness.saturating_add(1) as f32;
                TrackedTarget {
                    position,
                    velocity: (position - prev.position) * (1.0 / ticks),
                    last_seen: now,
                    staleness: 0,
                }
            }
        });
        self.target
    }
}

/// Highest confidence within `fov_radius` of `aim`; ties go to the closest.
fn select(detections: &[Detection], aim: Vec2, fov_radius: f32) -> Option<&Detection> {
    detections
        .iter()
        .filter(|d| d.position.distance(aim) <= fov_radius)
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    // Closer wins, so compare reversed.
                    b.position
                        .distance(aim)
                        .partial_cmp(&a.position.distance(aim))
                        .unwrap_or(Ordering::Equal)
                })
        })
}
