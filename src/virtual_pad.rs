use crate::assist::CorrectiveVector;
use crate::error::DriverError;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AbsInfo, AbsoluteAxisType, AttributeSet, BusType, EventType, InputEvent, InputId, Key, UinputAbsSetup};

const STICK_MIN: i32 = -32767;
const STICK_MAX: i32 = 32767;

/// Receives corrective vectors. Reports are absolute snapshots, so submitting
/// the same vector twice leaves the device in the same state.
pub trait StickSink: Send {
    fn submit(&mut self, vector: &CorrectiveVector) -> Result<(), DriverError>;
}

/// Native analog-stick values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StickReport {
    pub x: i32,
    pub y: i32,
}

impl StickReport {
    pub fn from_vector(vector: &CorrectiveVector, invert_y: bool) -> Self {
        let y_sign = if invert_y { -1.0f32 } else { 1.0 };
        let scale = |v: f32| -> i32 {
            let v = if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
            ((v * STICK_MAX as f32).round() as i32).clamp(STICK_MIN, STICK_MAX)
        };
        Self {
            x: scale(vector.x),
            y: scale(vector.y * y_sign),
        }
    }
}

/// Low-level device endpoint that accepts stick reports.
pub trait ReportWriter: Send {
    fn write(&mut self, report: StickReport) -> std::io::Result<()>;
    /// Recreate the endpoint after a failure.
    fn reconnect(&mut self) -> std::io::Result<()>;
}

/// Virtual controller adapter: maps vectors to reports and surfaces device
/// failures. After a failure the next submission tries to reconnect first.
pub struct VirtualPad<W: ReportWriter> {
    writer: W,
    invert_y: bool,
    connected: bool,
}

impl<W: ReportWriter> VirtualPad<W> {
    pub fn new(writer: W, invert_y: bool) -> Self {
        Self {
            writer,
            invert_y,
            connected: true,
        }
    }
}

impl<W: ReportWriter> StickSink for VirtualPad<W> {
    fn submit(&mut self, vector: &CorrectiveVector) -> Result<(), DriverError> {
        if !self.connected {
            self.writer.reconnect().map_err(DriverError::NotPresent)?;
            log::info!("Virtual gamepad reconnected");
            self.connected = true;
        }

        let report = StickReport::from_vector(vector, self.invert_y);
        self.writer.write(report).map_err(|e| {
            self.connected = false;
            DriverError::Rejected(e)
        })
    }
}

/// uinput-backed gamepad exposing both sticks; reports go to one of them.
pub struct UinputWriter {
    device: VirtualDevice,
    axis_x: AbsoluteAxisType,
    axis_y: AbsoluteAxisType,
}

impl UinputWriter {
    pub fn new(use_left_stick: bool) -> std::io::Result<Self> {
        let (axis_x, axis_y) = if use_left_stick {
            (AbsoluteAxisType::ABS_X, AbsoluteAxisType::ABS_Y)
        } else {
            (AbsoluteAxisType::ABS_RX, AbsoluteAxisType::ABS_RY)
        };

        log::info!(
            "Created virtual gamepad (output: {} stick)",
            if use_left_stick { "left" } else { "right" }
        );

        Ok(Self {
            device: build_device()?,
            axis_x,
            axis_y,
        })
    }
}

fn build_device() -> std::io::Result<VirtualDevice> {
    let abs = |axis: AbsoluteAxisType| -> UinputAbsSetup {
        UinputAbsSetup::new(axis, AbsInfo::new(0, STICK_MIN, STICK_MAX, 16, 128, 1))
    };

    // A few buttons so games classify the device as a gamepad
    let mut keys = AttributeSet::<Key>::new();
    keys.insert(Key::BTN_SOUTH);
    keys.insert(Key::BTN_EAST);
    keys.insert(Key::BTN_NORTH);
    keys.insert(Key::BTN_WEST);

    VirtualDeviceBuilder::new()?
        .name("aimlink Stick")
        .input_id(InputId::new(BusType::BUS_VIRTUAL, 0x1234, 0x5679, 1))
        .with_keys(&keys)?
        .with_absolute_axis(&abs(AbsoluteAxisType::ABS_X))?
        .with_absolute_axis(&abs(AbsoluteAxisType::ABS_Y))?
        .with_absolute_axis(&abs(AbsoluteAxisType::ABS_RX))?
        .with_absolute_axis(&abs(AbsoluteAxisType::ABS_RY))?
        .build()
}

impl ReportWriter for UinputWriter {
    fn write(&mut self, report: StickReport) -> std::io::Result<()> {
        self.device.emit(&[
            InputEvent::new_now(EventType::ABSOLUTE, self.axis_x.0, report.x),
            InputEvent::new_now(EventType::ABSOLUTE, self.axis_y.0, report.y),
            InputEvent::new_now(EventType::SYNCHRONIZATION, 0, 0),
        ])
    }

    fn reconnect(&mut self) -> std::io::Result<()> {
        self.device = build_device()?;
        Ok(())
    }
}
