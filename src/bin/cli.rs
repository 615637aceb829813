use anyhow::{bail, Context, Result};
use camcore::permissions::{FixedPermissions, PermissionService};
use camcore::platform::{CaptureBackend, SyntheticBackend};
use camcore::{
    CamCoreConfig, Camera, CameraEnvironment, CameraEvent, DeviceMonitor, ImageFileFormat,
    MediaType, ResolutionPreset, VideoStabilization,
};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "Usage: camcore-cli <command> [args] [--synthetic] [--config <path>] [--json]

Commands:
  info
  list-devices [--audio]
  list-formats <device_id>
  capture <device_id> [--preset <preset>] [--fps <n>] [--format jpeg|png] [--output <dir>] [--count <n>]
  stream <device_id> [--frames <n>] [--timeout <ms>]
  record <device_id> [--seconds <n>] [--output <dir>] [--stabilization off|standard|cinematic]
  watch [--interval <ms>]";

/// Flags shared by every command.
struct Options {
    json: bool,
    synthetic: bool,
    config: CamCoreConfig,
    positional: Vec<String>,
    flags: Vec<(String, String)>,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self> {
        let mut json = false;
        let mut synthetic = !cfg!(feature = "native");
        let mut config_path = None;
        let mut positional = Vec::new();
        let mut flags = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--json" => json = true,
                "--synthetic" => synthetic = true,
                "--audio" => flags.push(("--audio".to_string(), String::new())),
                "--config" => {
                    i += 1;
                    config_path = Some(args.get(i).context("--config needs a path")?.clone());
                }
                flag if flag.starts_with("--") => {
                    i += 1;
                    let value = args
                        .get(i)
                        .with_context(|| format!("{flag} needs a value"))?
                        .clone();
                    flags.push((flag.to_string(), value));
                }
                other => positional.push(other.to_string()),
            }
            i += 1;
        }

        let config = match config_path {
            Some(path) => CamCoreConfig::load_from_file(path)?,
            None => CamCoreConfig::load_or_default(),
        };

        Ok(Self {
            json,
            synthetic,
            config,
            positional,
            flags,
        })
    }

    fn flag(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(flag, _)| flag == name)
            .map(|(_, value)| value.as_str())
    }

    fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|(flag, _)| flag == name)
    }

    fn device_id(&self) -> Result<&str> {
        self.positional
            .first()
            .map(String::as_str)
            .context("device_id required")
    }

    fn environment(&self) -> Result<CameraEnvironment> {
        let (backend, permissions): (Arc<dyn CaptureBackend>, Arc<dyn PermissionService>) =
            if self.synthetic {
                (
                    Arc::new(SyntheticBackend::with_default_devices()),
                    Arc::new(FixedPermissions::authorized()),
                )
            } else {
                native_backend()?
            };
        Ok(CameraEnvironment::new(backend, permissions).with_config(self.config.clone()))
    }
}

#[cfg(feature = "native")]
fn native_backend() -> Result<(Arc<dyn CaptureBackend>, Arc<dyn PermissionService>)> {
    Ok((
        Arc::new(camcore::platform::NokhwaBackend::new()),
        Arc::new(camcore::permissions::SystemPermissions::new()),
    ))
}

#[cfg(not(feature = "native"))]
fn native_backend() -> Result<(Arc<dyn CaptureBackend>, Arc<dyn PermissionService>)> {
    bail!("built without the `native` feature; rerun with --synthetic")
}

#[tokio::main]
async fn main() -> Result<()> {
    camcore::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }

    let command = args[1].as_str();
    let options = Options::parse(&args[2..])?;
    match command {
        "info" => cmd_info(&options),
        "list-devices" => cmd_list_devices(&options),
        "list-formats" => cmd_list_formats(&options),
        "capture" => cmd_capture(&options).await,
        "stream" => cmd_stream(&options).await,
        "record" => cmd_record(&options).await,
        "watch" => cmd_watch(&options).await,
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}\n{USAGE}", command);
            std::process::exit(1);
        }
    }
}

fn cmd_info(options: &Options) -> Result<()> {
    let info = camcore::get_info();
    if options.json {
        println!("{}", serde_json::to_string(&info)?);
    } else {
        println!("{} {} ({})", info.name, info.version, info.platform.as_str());
        println!("native backend: {}", info.native_backend);
    }
    Ok(())
}

fn cmd_list_devices(options: &Options) -> Result<()> {
    let media_type = if options.has_flag("--audio") {
        MediaType::Audio
    } else {
        MediaType::Video
    };
    let devices = options.environment()?.discovery().list_devices(media_type)?;
    if options.json {
        println!("{}", serde_json::to_string(&devices)?);
    } else {
        for d in devices {
            println!("{}: {} [{}]", d.id, d.name, d.position);
        }
    }
    Ok(())
}

fn cmd_list_formats(options: &Options) -> Result<()> {
    let device_id = options.device_id()?;
    let formats = options.environment()?.discovery().formats(device_id)?;
    if options.json {
        println!("{}", serde_json::to_string(&formats)?);
    } else {
        for f in formats {
            println!("{}", f);
        }
    }
    Ok(())
}

async fn cmd_capture(options: &Options) -> Result<()> {
    let device_id = options.device_id()?;
    let mut env = options.environment()?;
    let mut settings = env.config.media_settings();

    if let Some(preset) = options.flag("--preset") {
        settings.resolution_preset = preset
            .parse::<ResolutionPreset>()
            .map_err(anyhow::Error::msg)?;
    }
    if let Some(fps) = options.flag("--fps") {
        settings.frames_per_second = Some(fps.parse().context("invalid --fps")?);
    }
    if let Some(format) = options.flag("--format") {
        settings.image_format = format
            .parse::<ImageFileFormat>()
            .map_err(anyhow::Error::msg)?;
    }
    if let Some(output) = options.flag("--output") {
        env.config.storage.output_directory = output.to_string();
    }
    let count: usize = match options.flag("--count") {
        Some(count) => count.parse().context("invalid --count")?,
        None => 1,
    };

    let camera = Camera::open(device_id, settings, env).await?;
    let mut saved = Vec::new();
    for _ in 0..count {
        match camera.take_picture().await {
            Ok(path) => {
                if !options.json {
                    println!("Saved {}", path.display());
                }
                saved.push(path);
            }
            Err(e) => {
                camera.close().await?;
                bail!("capture failed: {e}");
            }
        }
    }
    camera.close().await?;

    if options.json {
        println!("{}", serde_json::to_string(&saved)?);
    }
    Ok(())
}

async fn cmd_stream(options: &Options) -> Result<()> {
    let device_id = options.device_id()?;
    let frames: Option<u64> = options
        .flag("--frames")
        .map(|n| n.parse())
        .transpose()
        .context("invalid --frames")?;
    let timeout_ms: u64 = match options.flag("--timeout") {
        Some(ms) => ms.parse().context("invalid --timeout")?,
        None => 1000,
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let env = options.environment()?;
    let settings = env.config.media_settings();
    let camera = Camera::open(device_id, settings, env).await?;
    let handler = camera.stream_handler();
    let events = camera.events();
    camera.start_preview().await?;

    let mut received = 0u64;
    while running.load(Ordering::SeqCst) && frames.map_or(true, |n| received < n) {
        match handler
            .recv_frame_timeout(Duration::from_millis(timeout_ms))
            .await
        {
            Some(frame) => {
                received += 1;
                if options.json {
                    println!("{}", serde_json::to_string(&frame)?);
                } else {
                    println!(
                        "Frame: {}x{} {} seq:{} rot:{}",
                        frame.width,
                        frame.height,
                        frame.pixel_format,
                        frame.sequence,
                        frame.rotation_degrees
                    );
                }
            }
            None if options.json => println!("null"),
            None => println!("Timeout"),
        }

        while let Some(event) = events.poll_event().await {
            match event {
                CameraEvent::FrameAvailable { .. } => {}
                CameraEvent::SessionInterrupted { message } => {
                    eprintln!("Session interrupted: {message}");
                    running.store(false, Ordering::SeqCst);
                }
                other => log::info!("Event: {:?}", other),
            }
        }
    }

    camera.stop_preview().await?;
    let dropped = handler.dropped_frames();
    camera.close().await?;
    if !options.json {
        println!("Received {received} frames, dropped {dropped}");
    }
    Ok(())
}

async fn cmd_record(options: &Options) -> Result<()> {
    let device_id = options.device_id()?;
    let seconds: f64 = match options.flag("--seconds") {
        Some(n) => n.parse().context("invalid --seconds")?,
        None => 5.0,
    };
    let stabilization = match options.flag("--stabilization") {
        None | Some("off") => VideoStabilization::Off,
        Some("standard") => VideoStabilization::Standard,
        Some("cinematic") => VideoStabilization::Cinematic,
        Some(other) => bail!("unknown stabilization mode: {other}"),
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let mut env = options.environment()?;
    if let Some(output) = options.flag("--output") {
        env.config.storage.output_directory = output.to_string();
    }
    let settings = env.config.media_settings();
    let camera = Camera::open(device_id, settings, env).await?;
    camera.set_video_stabilization(stabilization).await?;

    let path = match camera.start_video_recording().await {
        Ok(path) => path,
        Err(e) => {
            camera.close().await?;
            bail!("recording failed: {e}");
        }
    };
    if !options.json {
        println!("Recording to {} (Ctrl-C to stop)", path.display());
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(seconds);
    while running.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !camera.is_recording() {
            eprintln!("Recording ended early");
            break;
        }
    }

    let stats = camera.stop_video_recording().await;
    camera.close().await?;
    let stats = stats?;
    if options.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!(
            "Saved {}: {} frames, {:.1}s, {} bytes",
            stats.path.display(),
            stats.video_frames,
            stats.duration_secs,
            stats.bytes_written
        );
    }
    Ok(())
}

async fn cmd_watch(options: &Options) -> Result<()> {
    let interval = match options.flag("--interval") {
        Some(ms) => Duration::from_millis(ms.parse().context("invalid --interval")?),
        None => DeviceMonitor::DEFAULT_INTERVAL,
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let monitor = DeviceMonitor::with_interval(options.environment()?.discovery(), interval);
    monitor.start_monitoring().await?;
    for device in monitor.get_active_devices().await {
        println!("present: {} ({})", device.id, device.name);
    }

    while running.load(Ordering::SeqCst) {
        match tokio::time::timeout(Duration::from_millis(200), monitor.wait_for_event()).await {
            Ok(Some(event)) if options.json => println!("{}", serde_json::to_string(&event)?),
            Ok(Some(event)) => println!("{:?}", event),
            Ok(None) => break,
            Err(_) => {}
        }
    }

    monitor.stop_monitoring().await?;
    Ok(())
}
