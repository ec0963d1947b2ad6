mod assist;
mod capture;
mod config;
mod detector;
mod error;
mod geometry;
mod mode;
mod orchestrator;
mod slot;
mod stats;
mod tracker;
mod virtual_pad;

use capture::{CaptureState, RawFrameReader, SlotFrameSource};
use clap::Parser;
use config::{AssistConfig, Cli, ConfigHandle};
use detector::{BrightSpotDetector, OffloadedDetector};
use geometry::Vec2;
use mode::{AssistGate, AssistMode};
use orchestrator::Orchestrator;
use stats::PipelineStats;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use virtual_pad::{UinputWriter, VirtualPad};

static QUIT: AtomicBool = AtomicBool::new(false);
static TOGGLE_MAPPING: AtomicBool = AtomicBool::new(false);
static TOGGLE_SYSTEM: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

/// Smallest blob (pixels) the bright-spot detector reports.
const MIN_BLOB_AREA: usize = 4;

fn main() {
    // Control commands are sent to the running instance as signals and exit
    // immediately, before clap parsing.
    if let Some(cmd) = std::env::args().nth(1) {
        let sig = match cmd.as_str() {
            "toggle-system" => Some((libc::SIGUSR2, "Toggle system")),
            "toggle-mapping" => Some((libc::SIGUSR1, "Toggle mapping")),
            "reload" => Some((libc::SIGHUP, "Reload")),
            "quit" => Some((libc::SIGTERM, "Quit")),
            _ => None,
        };
        if let Some((sig, action)) = sig {
            send_to_running(sig, action);
            return;
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let assist_config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    println!("aimlink - detection-driven stick assist");
    println!("  Frames:      {} ({}x{})", cli.frames, cli.width, cli.height);
    println!("  Tick:        {} us ({:?})", cli.tick_us(), cli.profile);
    println!("  Sensitivity: {:.2}", assist_config.sensitivity);
    println!("  Dead zone:   {:.1} px", assist_config.dead_zone_radius);
    println!("  Aim point:   ({:.0}, {:.0})", assist_config.aim_point.x, assist_config.aim_point.y);
    println!("  Output:      {} stick", if cli.left_stick { "left" } else { "right" });
    println!();

    signal_setup();

    // Create virtual gamepad
    let writer = match UinputWriter::new(cli.left_stick) {
        Ok(w) => w,
        Err(e) => {
            log::error!("Failed to create virtual gamepad: {}", e);
            log::error!("Do you have /dev/uinput access? Try: sudo modprobe uinput");
            std::process::exit(1);
        }
    };
    let gate = Arc::new(AssistGate::new(Box::new(VirtualPad::new(writer, cli.invert_y))));
    let config = ConfigHandle::new(assist_config);
    let stats = Arc::new(PipelineStats::new());

    // Spawn frame reader thread
    let capture = Arc::new(CaptureState::new());
    let reader = match RawFrameReader::open(&cli.frames, cli.width, cli.height, Arc::clone(&capture)) {
        Ok(r) => r,
        Err(e) => {
            log::error!("Failed to open frame feed {}: {}", cli.frames, e);
            std::process::exit(1);
        }
    };
    let capture_thread = std::thread::Builder::new()
        .name("frame-reader".into())
        .spawn(move || {
            let mut reader = reader;
            reader.run();
        });
    if let Err(e) = capture_thread {
        log::error!("Failed to spawn frame reader: {}", e);
        std::process::exit(1);
    }

    let detector = match OffloadedDetector::spawn(BrightSpotDetector::new(cli.threshold, MIN_BLOB_AREA)) {
        Ok(d) => d,
        Err(e) => {
            log::error!("Failed to spawn detector thread: {}", e);
            std::process::exit(1);
        }
    };

    let control_thread = {
        let gate = Arc::clone(&gate);
        let config = config.clone();
        let path = cli.config.clone();
        let overrides = Overrides::from_cli(&cli);
        std::thread::Builder::new()
            .name("control".into())
            .spawn(move || control_loop(&gate, &config, path, overrides))
    };
    let control_thread = match control_thread {
        Ok(t) => t,
        Err(e) => {
            log::error!("Failed to spawn control thread: {}", e);
            std::process::exit(1);
        }
    };

    if cli.start || cli.enable {
        if let Err(e) = gate.start() {
            log::warn!("Start failed: {}", e);
        }
    }
    if cli.enable {
        if let Err(e) = gate.enable_mapping() {
            log::warn!("Enable mapping failed: {}", e);
        }
    }

    println!("Start/stop:     aimlink toggle-system");
    println!("Enable mapping: aimlink toggle-mapping");
    println!("Reload config:  aimlink reload");
    println!("Quit:           aimlink quit");
    println!();

    let mut orchestrator = Orchestrator::new(
        Box::new(SlotFrameSource::new(Arc::clone(&capture))),
        Box::new(detector),
        Arc::clone(&gate),
        config,
        Arc::clone(&stats),
        Duration::from_micros(cli.tick_us()),
    )
    .with_debug(cli.debug);

    let result = orchestrator.run(|| QUIT.load(Ordering::Relaxed) || capture.eof.load(Ordering::Relaxed));

    log::info!("Shutting down...");
    QUIT.store(true, Ordering::Relaxed);
    capture.quit.store(true, Ordering::Relaxed);
    let _ = control_thread.join();
    drop(orchestrator);
    log::info!("{}", stats.snapshot());
    log::info!(
        "Frames read: {}, dropped unconsumed: {}",
        capture.frames.load(Ordering::Relaxed),
        capture.dropped.load(Ordering::Relaxed)
    );

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
    log::info!("Done");
}

/// CLI values that take precedence over the config file, also on reload.
#[derive(Debug, Clone, Copy)]
struct Overrides {
    sensitivity: Option<f32>,
    dead_zone: Option<f32>,
    frame_center: Vec2,
}

impl Overrides {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            sensitivity: cli.sensitivity,
            dead_zone: cli.dead_zone,
            frame_center: Vec2::new(cli.width as f32 / 2.0, cli.height as f32 / 2.0),
        }
    }

    /// Read `path` (aim point defaulting to the frame center) and apply the
    /// CLI overrides. Used at startup and on every reload.
    fn load_file(&self, path: &Path) -> Result<AssistConfig, error::ConfigError> {
        let mut config = AssistConfig::load(path, self.frame_center)?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut AssistConfig) {
        if let Some(s) = self.sensitivity {
            config.sensitivity = s;
        }
        if let Some(d) = self.dead_zone {
            config.dead_zone_radius = d;
        }
    }
}

fn load_config(cli: &Cli) -> Result<AssistConfig, error::ConfigError> {
    let overrides = Overrides::from_cli(cli);
    match &cli.config {
        Some(path) => overrides.load_file(path),
        None => {
            let mut config = AssistConfig {
                aim_point: overrides.frame_center,
                ..Default::default()
            };
            overrides.apply(&mut config);
            config.validate()?;
            Ok(config)
        }
    }
}

/// Applies signal-driven commands to the gate. These are the only external
/// mode transitions.
fn control_loop(gate: &AssistGate, config: &ConfigHandle, path: Option<PathBuf>, overrides: Overrides) {
    while !QUIT.load(Ordering::Relaxed) {
        if TOGGLE_SYSTEM.swap(false, Ordering::Relaxed) {
            let result = match gate.mode() {
                AssistMode::Stopped => gate.start(),
                AssistMode::Armed | AssistMode::Active => gate.stop(),
            };
            if let Err(e) = result {
                log::warn!("{}", e);
            }
        }

        if TOGGLE_MAPPING.swap(false, Ordering::Relaxed) {
            let result = match gate.mode() {
                AssistMode::Active => gate.disable_mapping(),
                AssistMode::Armed | AssistMode::Stopped => gate.enable_mapping(),
            };
            if let Err(e) = result {
                log::warn!("{}", e);
            }
        }

        if RELOAD.swap(false, Ordering::Relaxed) {
            match &path {
                Some(path) => match overrides.load_file(path).and_then(|c| config.swap(c)) {
                    Ok(()) => log::info!("Configuration reloaded from {}", path.display()),
                    Err(e) => log::warn!("Failed to reload config (keeping old config): {}", e),
                },
                None => log::warn!("Reload requested but no --config file was given"),
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}

fn signal_setup() {
    unsafe {
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGUSR1, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGHUP, signal_handler as libc::sighandler_t);
    }
}

extern "C" fn signal_handler(sig: libc::c_int) {
    match sig {
        libc::SIGUSR1 => TOGGLE_MAPPING.store(true, Ordering::Relaxed),
        libc::SIGUSR2 => TOGGLE_SYSTEM.store(true, Ordering::Relaxed),
        libc::SIGHUP => RELOAD.store(true, Ordering::Relaxed),
        _ => QUIT.store(true, Ordering::Relaxed),
    }
}

/// Find PID of a running aimlink instance by scanning /proc.
fn find_running_instance() -> Option<i32> {
    let my_pid = std::process::id() as i32;
    for entry in std::fs::read_dir("/proc").ok()? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let pid: i32 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(p) => p,
            None => continue,
        };
        if pid == my_pid {
            continue;
        }
        if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
            if comm.trim() == "aimlink" {
                return Some(pid);
            }
        }
    }
    None
}

/// Send a signal to the running aimlink instance, or exit with an error.
fn send_to_running(sig: libc::c_int, action: &str) {
    match find_running_instance() {
        Some(pid) => {
            let ret = unsafe { libc::kill(pid, sig) };
            if ret == 0 {
                eprintln!("{} sent to aimlink (pid {})", action, pid);
            } else {
                eprintln!("Failed to send signal to aimlink (pid {})", pid);
                std::process::exit(1);
            }
        }
        None => {
            eprintln!("No running aimlink instance found");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("aimlink").chain(args.iter().copied()))
    }

    #[test]
    fn default_aim_point_is_frame_center() {
        let config = load_config(&cli(&["--width", "640", "--height", "480"])).unwrap();
        assert_eq!(config.aim_point, Vec2::new(320.0, 240.0));
    }

    #[test]
    fn cli_overrides_apply_and_validate() {
        let config = load_config(&cli(&["--sensitivity", "2.0", "--dead-zone", "8"])).unwrap();
        assert_eq!(config.sensitivity, 2.0);
        assert_eq!(config.dead_zone_radius, 8.0);

        assert!(load_config(&cli(&["--sensitivity", "0"])).is_err());
    }

    #[test]
    fn config_file_without_aim_point_uses_frame_center() {
        let path = std::env::temp_dir().join(format!("aimlink-main-{}.toml", std::process::id()));
        std::fs::write(&path, "dead_zone_radius = 6.0\n").unwrap();
        let args = cli(&["--width", "640", "--height", "480", "--config", path.to_str().unwrap()]);

        let config = load_config(&args).unwrap();
        assert_eq!(config.aim_point, Vec2::new(320.0, 240.0));
        assert_eq!(config.dead_zone_radius, 6.0);

        // Reload goes through the same path.
        let handle = ConfigHandle::new(config);
        std::fs::write(&path, "dead_zone_radius = 9.0\n").unwrap();
        let reloaded = Overrides::from_cli(&args).load_file(&path).unwrap();
        handle.swap(reloaded).unwrap();
        assert_eq!(handle.snapshot().aim_point, Vec2::new(320.0, 240.0));
        assert_eq!(handle.snapshot().dead_zone_radius, 9.0);
        std::fs::remove_file(&path).unwrap();
    }
}
