use crate::error::DetectorError;
use crate::geometry::Vec2;
use crate::slot::LatestSlot;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// One captured screen frame: 8-bit grayscale, row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        }
    }
}

/// A target candidate in screen space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub position: Vec2,
    /// Confidence in [0, 1]
    pub confidence: f32,
    pub frame_ts: Instant,
}

/// Turns a frame into zero or more target candidates.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

/// Reference detector: pixels at or above `threshold` are grouped into
/// 4-connected blobs; each blob of at least `min_area` pixels becomes a
/// detection at its centroid.
pub struct BrightSpotDetector {
    threshold: u8,
    min_area: usize,
    visited: Vec<bool>,
    stack: Vec<usize>,
}

impl BrightSpotDetector {
    pub fn new(threshold: u8, min_area: usize) -> Self {
        Self {
            threshold,
            min_area: min_area.max(1),
            visited: Vec::new(),
            stack: Vec::new(),
        }
    }
}

impl Detector for BrightSpotDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let w = frame.width as usize;
        let h = frame.height as usize;
        if frame.data.len() != w * h {
            return Err(DetectorError::Unavailable(format!(
                "frame is {} bytes, expected {}x{}",
                frame.data.len(),
                w,
                h
            )));
        }

        self.visited.clear();
        self.visited.resize(w * h, false);
        let headroom = (255 - self.threshold).max(1) as f32;
        let mut found = Vec::new();

        for start in 0..w * h {
            if self.visited[start] || frame.data[start] < self.threshold {
                continue;
            }
            self.visited[start] = true;
            self.stack.push(start);

            let (mut area, mut sx, mut sy, mut excess) = (0usize, 0f64, 0f64, 0f64);
            while let Some(i) = self.stack.pop() {
                let (x, y) = (i % w, i / w);
                area += 1;
                sx += x as f64;
                sy += y as f64;
                excess += (frame.data[i] - self.threshold) as f64;

                let mut visit = |j: usize| {
                    if !self.visited[j] && frame.data[j] >= self.threshold {
                        self.visited[j] = true;
                        self.stack.push(j);
                    }
                };
                if x > 0 {
                    visit(i - 1);
                }
                if x + 1 < w {
                    visit(i + 1);
                }
                if y > 0 {
                    visit(i - w);
                }
                if y + 1 < h {
                    visit(i + w);
                }
            }

            if area < self.min_area {
                continue;
            }
            let n = area as f64;
            let confidence = ((excess / n) as f32 / headroom).clamp(0.0, 1.0);
            found.push(Detection {
                position: Vec2::new((sx / n) as f32, (sy / n) as f32),
                confidence,
                frame_ts: frame.captured_at,
            });
        }

        Ok(found)
    }
}

type DetectionResult = Result<Vec<Detection>, DetectorError>;

/// Runs a detector on its own thread. `detect` hands over the newest frame and
/// returns whatever result the worker has finished, never waiting for it.
pub struct OffloadedDetector {
    frames: Arc<LatestSlot<Frame>>,
    results: Arc<LatestSlot<DetectionResult>>,
    quit: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl OffloadedDetector {
    pub fn spawn<D: Detector + 'static>(mut inner: D) -> std::io::Result<Self> {
        let frames: Arc<LatestSlot<Frame>> = Arc::new(LatestSlot::new());
        let results = Arc::new(LatestSlot::new());
        let quit = Arc::new(AtomicBool::new(false));

        let worker = {
            let frames = Arc::clone(&frames);
            let results = Arc::clone(&results);
            let quit = Arc::clone(&quit);
            std::thread::Builder::new()
                .name("detector".into())
                .spawn(move || {
                    while !quit.load(Ordering::Relaxed) {
                        if let Some(frame) = frames.take_timeout(Duration::from_millis(50)) {
                            results.put(inner.detect(&frame));
                        }
                    }
                })?
        };

        Ok(Self {
            frames,
            results,
            quit,
            worker: Some(worker),
        })
    }
}

impl Detector for OffloadedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        if self.worker.as_ref().is_some_and(|w| w.is_finished()) {
            return Err(DetectorError::Unavailable("detector thread exited".into()));
        }
        self.frames.put(frame.clone());
        self.results.take().unwrap_or_else(|| Ok(Vec::new()))
    }
}

impl Drop for OffloadedDetector {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        self.frames.wake();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
