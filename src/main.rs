//! RayVox Engine
//!
//! This binary:
//! 1. Loads the engine configuration (first argument, or `rayvox.toml`)
//! 2. Creates the GPU device, and a window when presenting on screen
//! 3. Drives the frame loop until the window closes, Ctrl+C or `max_frames`
//! 4. Flushes every queue before exiting

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rayvox::config::Config;
use rayvox::gpu::null::NullDevice;
use rayvox::gpu::{GpuDevice, Surface};
use rayvox::input::EventQueue;
use rayvox::shader::ShaderLibrary;
use rayvox::FrameDriver;

const DEFAULT_CONFIG_PATH: &str = "rayvox.toml";
const HEADLESS_FRAME_LIMIT: u64 = 600;

/// Frames per second over one-second windows.
struct FrameClock {
    window_start: Instant,
    frames: u64,
}

impl FrameClock {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
        }
    }

    /// Returns the rate once a full second has elapsed.
    fn tick(&mut self) -> Option<f64> {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let fps = self.frames as f64 / elapsed.as_secs_f64();
        self.frames = 0;
        self.window_start = Instant::now();
        Some(fps)
    }
}

/// Engine service state
struct EngineService {
    config: Config,
    driver: Option<FrameDriver>,
    #[cfg(windows)]
    window: Option<rayvox::window::Window>,
    headless_events: EventQueue,
    shutdown: Arc<AtomicBool>,
}

impl EngineService {
    fn new(config: Config) -> Self {
        Self {
            config,
            driver: None,
            #[cfg(windows)]
            window: None,
            headless_events: EventQueue::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn headless(&self) -> bool {
        self.config.backend == "null"
    }

    /// Create the device (and window) and build the frame driver on top.
    fn init_renderer(&mut self) -> Result<()> {
        let settings = self.config.frame_settings()?;
        let shaders = ShaderLibrary::new(&self.config.shader_dir);
        let (device, surface) = self.create_device()?;
        info!("Using adapter: {}", device.adapter_name());

        self.driver = Some(FrameDriver::new(device, surface, &shaders, settings)?);
        Ok(())
    }

    fn create_device(&mut self) -> Result<(Box<dyn GpuDevice>, Surface)> {
        if self.headless() {
            info!("Initializing simulated GPU (headless)...");
            return Ok((Box::new(NullDevice::new()), Surface::Headless));
        }
        self.create_d3d12_device()
    }

    #[cfg(windows)]
    fn create_d3d12_device(&mut self) -> Result<(Box<dyn GpuDevice>, Surface)> {
        use rayvox::gpu::d3d12::{D3d12Device, D3d12Options};
        use rayvox::window::Window;

        info!("Initializing D3D12 device...");
        let window = Window::new(&self.config.window_title, self.config.width, self.config.height)?;
        let surface = window.surface();
        let device = D3d12Device::new(&D3d12Options {
            adapter_index: self.config.adapter_index,
            use_warp: self.config.use_warp,
            debug_layer: self.config.debug_layer,
        })?;
        self.window = Some(window);
        Ok((Box::new(device), surface))
    }

    #[cfg(not(windows))]
    fn create_d3d12_device(&mut self) -> Result<(Box<dyn GpuDevice>, Surface)> {
        bail!("the d3d12 backend is only available on Windows; set backend = \"null\"")
    }

    /// Main frame loop
    fn run_loop(&mut self) -> Result<()> {
        info!("Entering frame loop...");
        let max_frames = match self.config.max_frames {
            Some(limit) => Some(limit),
            None if self.headless() => Some(HEADLESS_FRAME_LIMIT),
            None => None,
        };
        let mut clock = FrameClock::new();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested");
                break;
            }

            let Some(driver) = self.driver.as_mut() else {
                bail!("Frame driver not initialized");
            };

            #[cfg(windows)]
            let events = match self.window.as_mut() {
                Some(window) => {
                    window.pump_messages();
                    window.events()
                }
                None => &mut self.headless_events,
            };
            #[cfg(not(windows))]
            let events = &mut self.headless_events;

            let report = match driver.render_frame(events) {
                Ok(report) => report,
                Err(e) => {
                    error!("Frame failed: {}", e);
                    break;
                }
            };

            if report.resized {
                info!("Resized to {:?}", driver.swap_chain().dimensions());
            }
            if let Some(fps) = clock.tick() {
                info!(
                    "FPS: {:.1} (frame {}, fence {})",
                    fps, report.frame, report.fence_value
                );
            }
            if report.close_requested {
                info!("Window closed, shutting down...");
                break;
            }
            if max_frames.is_some_and(|limit| driver.frame_count() >= limit) {
                info!("Reached frame limit of {}", driver.frame_count());
                break;
            }
        }

        Ok(())
    }

    /// Drain all GPU work and release resources before the device goes away.
    fn shutdown_renderer(&mut self) -> Result<()> {
        if let Some(mut driver) = self.driver.take() {
            info!("Flushing GPU queues ({} frames rendered)", driver.frame_count());
            driver.shutdown()?;
        }
        #[cfg(windows)]
        {
            self.window = None;
        }
        Ok(())
    }
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => Config::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH),
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    let config = load_config();

    // Initialize logging
    let default_filter = config
        .as_ref()
        .map(|c| c.log_filter.clone())
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("RayVox Engine starting...");
    let config = config?;
    info!("Configuration loaded: {:?}", config);

    let mut service = EngineService::new(config);

    // Setup Ctrl+C handler
    let shutdown = service.shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown.store(true, Ordering::Relaxed);
    }) {
        warn!("Failed to set Ctrl+C handler: {}", e);
    }

    service.init_renderer()?;

    let result = service.run_loop();

    info!("Engine shutting down");
    if let Err(e) = service.shutdown_renderer() {
        error!("Shutdown failed: {}", e);
        return result.and(Err(e));
    }

    result
}
