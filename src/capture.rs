use crate::detector::Frame;
use crate::slot::LatestSlot;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Supplies frames on demand. Must not block.
pub trait FrameSource: Send {
    fn try_acquire(&mut self) -> Option<Frame>;
}

/// State shared between the frame reader thread and the control loop.
pub struct CaptureState {
    pub latest: LatestSlot<Frame>,
    pub frames: AtomicU64,
    /// Frames overwritten before the loop consumed them
    pub dropped: AtomicU64,
    pub quit: AtomicBool,
    pub eof: AtomicBool,
}

impl CaptureState {
    pub fn new() -> Self {
        Self {
            latest: LatestSlot::new(),
            frames: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            quit: AtomicBool::new(false),
            eof: AtomicBool::new(false),
        }
    }

    /// Publish a frame, overwriting any unconsumed one.
    pub fn publish(&self, frame: Frame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if self.latest.put(frame) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

/// Control-loop side of a capture thread.
pub struct SlotFrameSource {
    state: Arc<CaptureState>,
}

impl SlotFrameSource {
    pub fn new(state: Arc<CaptureState>) -> Self {
        Self { state }
    }
}

impl FrameSource for SlotFrameSource {
    fn try_acquire(&mut self) -> Option<Frame> {
        self.state.latest.take()
    }
}

/// Reads fixed-size raw grayscale frames (width * height bytes each) from a
/// byte stream, e.g. `ffmpeg -f rawvideo -pix_fmt gray -`.
pub struct RawFrameReader {
    input: Box<dyn Read + Send>,
    width: u32,
    height: u32,
    state: Arc<CaptureState>,
}

impl RawFrameReader {
    /// Open `path`, or stdin when `path` is `-`.
    pub fn open(path: &str, width: u32, height: u32, state: Arc<CaptureState>) -> std::io::Result<Self> {
        let input: Box<dyn Read + Send> = if path == "-" {
            Box::new(std::io::stdin())
        } else {
            Box::new(std::fs::File::open(path)?)
        };
        log::info!("Reading {}x{} frames from {}", width, height, if path == "-" { "stdin" } else { path });
        Ok(Self::from_reader(input, width, height, state))
    }

    pub fn from_reader(input: Box<dyn Read + Send>, width: u32, height: u32, state: Arc<CaptureState>) -> Self {
        Self {
            input,
            width,
            height,
            state,
        }
    }

    /// Run the blocking read loop. Call from a dedicated thread.
    pub fn run(&mut self) {
        let size = self.width as usize * self.height as usize;
        loop {
            if self.state.quit.load(Ordering::Relaxed) {
                break;
            }

            let mut buf = vec![0u8; size];
            match self.input.read_exact(&mut buf) {
                Ok(()) => self.state.publish(Frame::new(buf, self.width, self.height)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    log::info!("Frame feed ended");
                    break;
                }
                Err(e) => {
                    log::error!("Error reading frames: {}", e);
                    break;
                }
            }
        }
        self.state.eof.store(true, Ordering::Relaxed);
    }
}
