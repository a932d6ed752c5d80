//! Configuration Module
//!
//! Handles configuration file parsing and conversion to frame settings.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::frame::{FrameSettings, RenderMode};
use crate::swapchain::{MAX_BUFFER_COUNT, MIN_BUFFER_COUNT};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// GPU backend: "d3d12" or "null"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// GPU adapter index (0 = first hardware adapter)
    #[serde(default)]
    pub adapter_index: u32,

    /// Use the WARP software adapter
    #[serde(default)]
    pub use_warp: bool,

    /// Enable the D3D12 debug layer
    #[serde(default)]
    pub debug_layer: bool,

    /// Initial surface width
    #[serde(default = "default_width")]
    pub width: u32,

    /// Initial surface height
    #[serde(default = "default_height")]
    pub height: u32,

    /// VSync enabled
    #[serde(default = "default_vsync")]
    pub vsync: bool,

    /// Number of back buffers (2..=16)
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,

    /// Frame content: "compute", "graphics" or "hybrid"
    #[serde(default = "default_render_mode")]
    pub render_mode: String,

    /// Dispatch on the compute queue
    #[serde(default)]
    pub async_compute: bool,

    /// Directory holding the HLSL sources
    #[serde(default = "default_shader_dir")]
    pub shader_dir: String,

    /// Fence wait timeout in milliseconds
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,

    /// Compute thread group edge, must match the compute shader
    #[serde(default = "default_thread_group_size")]
    pub thread_group_size: u32,

    /// Clear color for the graphics pass
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],

    /// Window title
    #[serde(default = "default_window_title")]
    pub window_title: String,

    /// Stop after this many frames (headless runs default to 600)
    #[serde(default)]
    pub max_frames: Option<u64>,

    /// tracing filter used when RUST_LOG is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_backend() -> String {
    if cfg!(windows) { "d3d12" } else { "null" }.to_string()
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    800
}

fn default_vsync() -> bool {
    true
}

fn default_buffer_count() -> u32 {
    3
}

fn default_render_mode() -> String {
    "compute".to_string()
}

fn default_shader_dir() -> String {
    "shaders".to_string()
}

fn default_fence_timeout_ms() -> u64 {
    5000
}

fn default_thread_group_size() -> u32 {
    8
}

fn default_clear_color() -> [f32; 4] {
    [0.4, 0.6, 0.9, 1.0]
}

fn default_window_title() -> String {
    "RayVox-Engine".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            adapter_index: 0,
            use_warp: false,
            debug_layer: false,
            width: default_width(),
            height: default_height(),
            vsync: default_vsync(),
            buffer_count: default_buffer_count(),
            render_mode: default_render_mode(),
            async_compute: false,
            shader_dir: default_shader_dir(),
            fence_timeout_ms: default_fence_timeout_ms(),
            thread_group_size: default_thread_group_size(),
            clear_color: default_clear_color(),
            window_title: default_window_title(),
            max_frames: None,
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&self.buffer_count) {
            bail!(
                "buffer_count must be between {} and {}, got {}",
                MIN_BUFFER_COUNT,
                MAX_BUFFER_COUNT,
                self.buffer_count
            );
        }
        if self.width == 0 || self.height == 0 {
            bail!("surface size must be at least 1x1, got {}x{}", self.width, self.height);
        }
        if self.thread_group_size == 0 {
            bail!("thread_group_size must be at least 1");
        }
        if !matches!(self.backend.as_str(), "d3d12" | "null") {
            bail!("unknown backend {:?}", self.backend);
        }
        self.render_mode()?;
        Ok(())
    }

    pub fn render_mode(&self) -> Result<RenderMode> {
        self.render_mode.parse().map_err(anyhow::Error::msg)
    }

    pub fn frame_settings(&self) -> Result<FrameSettings> {
        Ok(FrameSettings {
            width: self.width,
            height: self.height,
            buffer_count: self.buffer_count,
            render_mode: self.render_mode()?,
            vsync: self.vsync,
            async_compute: self.async_compute,
            clear_color: self.clear_color,
            thread_group_size: self.thread_group_size,
            fence_timeout: Duration::from_millis(self.fence_timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rayvox.toml");
        let config = Config {
            backend: "null".to_string(),
            buffer_count: 2,
            render_mode: "hybrid".to_string(),
            async_compute: true,
            max_frames: Some(42),
            ..Config::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.buffer_count, 2);
        assert_eq!(loaded.render_mode().unwrap(), RenderMode::Hybrid);
        assert!(loaded.async_compute);
        assert_eq!(loaded.max_frames, Some(42));
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "backend = \"null\"\nvsync = false\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.vsync);
        assert_eq!((config.width, config.height), (800, 800));
        assert_eq!(config.buffer_count, 3);
        assert_eq!(config.shader_dir, "shaders");
        assert_eq!(config.fence_timeout_ms, 5000);
        assert_eq!(config.window_title, "RayVox-Engine");
        assert_eq!(config.clear_color, [0.4, 0.6, 0.9, 1.0]);
        assert_eq!(config.max_frames, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            Config {
                buffer_count: 1,
                ..Config::default()
            },
            Config {
                buffer_count: 17,
                ..Config::default()
            },
            Config {
                width: 0,
                ..Config::default()
            },
            Config {
                thread_group_size: 0,
                ..Config::default()
            },
            Config {
                render_mode: "raytrace".to_string(),
                ..Config::default()
            },
        ];
        for config in &bad {
            assert!(config.validate().is_err(), "{:?}", config);
        }
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_frame_settings_conversion() {
        let config = Config {
            fence_timeout_ms: 250,
            render_mode: "graphics".to_string(),
            ..Config::default()
        };
        let settings = config.frame_settings().unwrap();
        assert_eq!(settings.fence_timeout, Duration::from_millis(250));
        assert_eq!(settings.render_mode, RenderMode::Graphics);
        assert_eq!(settings.buffer_count, 3);
    }
}
