use crate::assist::CorrectiveVector;
use crate::error::{DriverError, InvalidTransition, TransitionError};
use crate::virtual_pad::StickSink;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistMode {
    Stopped,
    Armed,
    Active,
}

impl AssistMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => AssistMode::Armed,
            2 => AssistMode::Active,
            _ => AssistMode::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            AssistMode::Stopped => 0,
            AssistMode::Armed => 1,
            AssistMode::Active => 2,
        }
    }
}

impl std::fmt::Display for AssistMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            AssistMode::Stopped => "Stopped",
            AssistMode::Armed => "Armed",
            AssistMode::Active => "Active",
        })
    }
}

/// What the gate did with a tick's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Computed output was submitted (mode Active)
    Sent,
    /// A pending neutral report was submitted
    Neutralized,
    /// Nothing submitted
    Suppressed,
}

struct Output {
    sink: Box<dyn StickSink>,
    neutral_pending: bool,
}

impl Output {
    fn flush_neutral(&mut self) -> Result<(), DriverError> {
        self.neutral_pending = true;
        self.sink.submit(&CorrectiveVector::neutral(Instant::now()))?;
        self.neutral_pending = false;
        Ok(())
    }
}

/// `Stopped -> Armed -> Active` and back. Every entry into `Stopped` or
/// `Armed` sends one neutral report; computed output only reaches the sink
/// while `Active`.
pub struct AssistGate {
    mode: AtomicU8,
    output: Mutex<Output>,
}

impl AssistGate {
    /// New gate in `Stopped`. Sends nothing until a command or tick needs it.
    pub fn new(sink: Box<dyn StickSink>) -> Self {
        Self {
            mode: AtomicU8::new(AssistMode::Stopped.as_u8()),
            output: Mutex::new(Output {
                sink,
                neutral_pending: false,
            }),
        }
    }

    pub fn mode(&self) -> AssistMode {
        AssistMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// "Start System": Stopped -> Armed.
    pub fn start(&self) -> Result<(), TransitionError> {
        self.transition(&[AssistMode::Stopped], AssistMode::Armed, "start")
    }

    /// Armed/Active -> Stopped. On return a neutral report has been sent
    /// (or is retried every tick if the device is gone) and no later
    /// dispatch can carry non-neutral output.
    pub fn stop(&self) -> Result<(), TransitionError> {
        self.transition(&[AssistMode::Armed, AssistMode::Active], AssistMode::Stopped, "stop")
    }

    /// "Enable Mapping": Armed -> Active.
    pub fn enable_mapping(&self) -> Result<(), TransitionError> {
        self.transition(&[AssistMode::Armed], AssistMode::Active, "enable mapping")
    }

    /// Active -> Armed.
    pub fn disable_mapping(&self) -> Result<(), TransitionError> {
        self.transition(&[AssistMode::Active], AssistMode::Armed, "disable mapping")
    }

    fn transition(&self, from: &[AssistMode], to: AssistMode, request: &'static str) -> Result<(), TransitionError> {
        // The output lock serializes transitions against dispatch, so a tick
        // that read `Active` cannot submit after the neutral flush below.
        let mut output = self.output.lock();
        let current = self.mode();
        if !from.contains(&current) {
            return Err(InvalidTransition { from: current, request }.into());
        }
        self.mode
            .compare_exchange(current.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| InvalidTransition {
                from: AssistMode::from_u8(actual),
                request,
            })?;
        log::info!("Assist {} -> {}", current, to);

        if to != AssistMode::Active {
            // Mode change stands; the neutral report stays pending for dispatch.
            output
                .flush_neutral()
                .map_err(|source| TransitionError::NeutralNotDelivered { to, source })?;
        }
        Ok(())
    }

    /// Forward one tick's output according to the current mode.
    ///
    /// A driver error while `Active` drops the mode to `Armed` and is
    /// returned to the caller.
    pub fn dispatch(&self, vector: &CorrectiveVector) -> Result<Dispatch, DriverError> {
        let mut output = self.output.lock();
        match self.mode() {
            AssistMode::Active => match output.sink.submit(vector) {
                Ok(()) => Ok(Dispatch::Sent),
                Err(e) => {
                    self.mode.store(AssistMode::Armed.as_u8(), Ordering::Release);
                    log::warn!("Assist Active -> Armed: {}", e);
                    if let Err(retry) = output.flush_neutral() {
                        log::debug!("Neutral report pending: {}", retry);
                    }
                    Err(e)
                }
            },
            AssistMode::Armed | AssistMode::Stopped => {
                if output.neutral_pending {
                    output.flush_neutral()?;
                    log::debug!("Pending neutral report delivered");
                    return Ok(Dispatch::Neutralized);
                }
                Ok(Dispatch::Suppressed)
            }
        }
    }
}
