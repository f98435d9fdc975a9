use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CaptureError, CaptureResult};
use crate::frame::{Facing, Rotation, Size, MAX_PREVIEW_BUFFERS};

const DEFAULT_FPS: f32 = 30.0;
const DEFAULT_PREVIEW_WIDTH: u32 = 1024;
const DEFAULT_PREVIEW_HEIGHT: u32 = 768;
const DEFAULT_BUFFER_COUNT: usize = 4;
const MIN_BUFFER_COUNT: usize = 2;
const DEFAULT_SHUTDOWN_WARN_MS: u64 = 2_000;
const MAX_PREVIEW_DIMENSION: u32 = 1_000_000;

// ----------------------------------------------------------------------------
// Focus and flash modes
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FocusMode {
    ContinuousPicture,
    ContinuousVideo,
    Auto,
    Edof,
    Fixed,
    Infinity,
    Macro,
}

impl FocusMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FocusMode::ContinuousPicture => "continuous-picture",
            FocusMode::ContinuousVideo => "continuous-video",
            FocusMode::Auto => "auto",
            FocusMode::Edof => "edof",
            FocusMode::Fixed => "fixed",
            FocusMode::Infinity => "infinity",
            FocusMode::Macro => "macro",
        }
    }
}

impl FromStr for FocusMode {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous-picture" => Ok(FocusMode::ContinuousPicture),
            "continuous-video" => Ok(FocusMode::ContinuousVideo),
            "auto" => Ok(FocusMode::Auto),
            "edof" => Ok(FocusMode::Edof),
            "fixed" => Ok(FocusMode::Fixed),
            "infinity" => Ok(FocusMode::Infinity),
            "macro" => Ok(FocusMode::Macro),
            other => Err(CaptureError::config(format!("unknown focus mode {:?}", other))),
        }
    }
}

impl fmt::Display for FocusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashMode {
    On,
    Off,
    Auto,
    RedEye,
    Torch,
}

impl FlashMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashMode::On => "on",
            FlashMode::Off => "off",
            FlashMode::Auto => "auto",
            FlashMode::RedEye => "red-eye",
            FlashMode::Torch => "torch",
        }
    }
}

impl FromStr for FlashMode {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(FlashMode::On),
            "off" => Ok(FlashMode::Off),
            "auto" => Ok(FlashMode::Auto),
            "red-eye" => Ok(FlashMode::RedEye),
            "torch" => Ok(FlashMode::Torch),
            other => Err(CaptureError::config(format!("unknown flash mode {:?}", other))),
        }
    }
}

impl fmt::Display for FlashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// CaptureConfig
// ----------------------------------------------------------------------------

/// Requested capture parameters. Checked by `validate` before any session uses them.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureConfig {
    pub requested_fps: f32,
    pub preview_size: Size,
    pub facing: Facing,
    pub focus_mode: Option<FocusMode>,
    pub flash_mode: Option<FlashMode>,
    /// Preview buffers primed onto the device at start.
    pub buffer_count: usize,
    /// Current display rotation, supplied by the UI layer.
    pub display_rotation: Rotation,
    /// How long stop waits for the worker before logging a slow shutdown.
    pub shutdown_warn_after: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            requested_fps: DEFAULT_FPS,
            preview_size: Size::new(DEFAULT_PREVIEW_WIDTH, DEFAULT_PREVIEW_HEIGHT),
            facing: Facing::Back,
            focus_mode: None,
            flash_mode: None,
            buffer_count: DEFAULT_BUFFER_COUNT,
            display_rotation: Rotation::Deg0,
            shutdown_warn_after: Duration::from_millis(DEFAULT_SHUTDOWN_WARN_MS),
        }
    }
}

impl CaptureConfig {
    pub fn builder() -> CaptureConfigBuilder {
        CaptureConfigBuilder::default()
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if !self.requested_fps.is_finite() || self.requested_fps <= 0.0 {
            return Err(CaptureError::config(format!(
                "invalid fps: {}",
                self.requested_fps
            )));
        }
        let Size { width, height } = self.preview_size;
        if width == 0 || width > MAX_PREVIEW_DIMENSION || height == 0 || height > MAX_PREVIEW_DIMENSION
        {
            return Err(CaptureError::config(format!(
                "invalid preview size: {}x{}",
                width, height
            )));
        }
        if !(MIN_BUFFER_COUNT..=MAX_PREVIEW_BUFFERS).contains(&self.buffer_count) {
            return Err(CaptureError::config(format!(
                "buffer count {} outside {}..={}",
                self.buffer_count, MIN_BUFFER_COUNT, MAX_PREVIEW_BUFFERS
            )));
        }
        Ok(())
    }

    /// Load from the file named by `CAPTURE_CONFIG` (if set), apply `CAPTURE_*`
    /// environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let file_cfg = match std::env::var("CAPTURE_CONFIG").ok().as_deref() {
            Some(path) => read_config_file(Path::new(path))?,
            None => CaptureConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(fps) = file.fps {
            builder = builder.requested_fps(fps);
        }
        if let Some(preview) = file.preview {
            builder = builder.preview_size(
                preview.width.unwrap_or(DEFAULT_PREVIEW_WIDTH),
                preview.height.unwrap_or(DEFAULT_PREVIEW_HEIGHT),
            );
        }
        if let Some(facing) = file.facing {
            builder = builder.facing(facing.parse()?);
        }
        if let Some(mode) = file.focus_mode {
            builder = builder.focus_mode(mode.parse()?);
        }
        if let Some(mode) = file.flash_mode {
            builder = builder.flash_mode(mode.parse()?);
        }
        if let Some(count) = file.buffer_count {
            builder = builder.buffer_count(count);
        }
        if let Some(degrees) = file.display_rotation {
            builder = builder.display_rotation(parse_rotation(degrees)?);
        }
        if let Some(ms) = file.shutdown_warn_ms {
            builder = builder.shutdown_warn_after(Duration::from_millis(ms));
        }
        Ok(builder.into_unchecked())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(fps) = env_parsed::<f32>("CAPTURE_FPS")? {
            self.requested_fps = fps;
        }
        if let Some(width) = env_parsed::<u32>("CAPTURE_WIDTH")? {
            self.preview_size.width = width;
        }
        if let Some(height) = env_parsed::<u32>("CAPTURE_HEIGHT")? {
            self.preview_size.height = height;
        }
        if let Some(facing) = env_value("CAPTURE_FACING") {
            self.facing = facing.parse()?;
        }
        if let Some(mode) = env_value("CAPTURE_FOCUS_MODE") {
            self.focus_mode = Some(mode.parse()?);
        }
        if let Some(mode) = env_value("CAPTURE_FLASH_MODE") {
            self.flash_mode = Some(mode.parse()?);
        }
        if let Some(count) = env_parsed::<usize>("CAPTURE_BUFFER_COUNT")? {
            self.buffer_count = count;
        }
        if let Some(degrees) = env_parsed::<u32>("CAPTURE_DISPLAY_ROTATION")? {
            self.display_rotation = parse_rotation(degrees)?;
        }
        Ok(())
    }
}

/// Builder for `CaptureConfig`. Setters only assign; `build` validates.
#[derive(Debug, Default)]
pub struct CaptureConfigBuilder {
    config: CaptureConfig,
}

impl CaptureConfigBuilder {
    pub fn requested_fps(mut self, fps: f32) -> Self {
        self.config.requested_fps = fps;
        self
    }

    pub fn preview_size(mut self, width: u32, height: u32) -> Self {
        self.config.preview_size = Size::new(width, height);
        self
    }

    pub fn facing(mut self, facing: Facing) -> Self {
        self.config.facing = facing;
        self
    }

    pub fn focus_mode(mut self, mode: FocusMode) -> Self {
        self.config.focus_mode = Some(mode);
        self
    }

    pub fn flash_mode(mut self, mode: FlashMode) -> Self {
        self.config.flash_mode = Some(mode);
        self
    }

    pub fn buffer_count(mut self, count: usize) -> Self {
        self.config.buffer_count = count;
        self
    }

    pub fn display_rotation(mut self, rotation: Rotation) -> Self {
        self.config.display_rotation = rotation;
        self
    }

    pub fn shutdown_warn_after(mut self, after: Duration) -> Self {
        self.config.shutdown_warn_after = after;
        self
    }

    pub fn build(self) -> CaptureResult<CaptureConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    fn into_unchecked(self) -> CaptureConfig {
        self.config
    }
}

// ----------------------------------------------------------------------------
// File + environment loading
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    fps: Option<f32>,
    preview: Option<PreviewConfigFile>,
    facing: Option<String>,
    focus_mode: Option<String>,
    flash_mode: Option<String>,
    buffer_count: Option<usize>,
    display_rotation: Option<u32>,
    shutdown_warn_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PreviewConfigFile {
    width: Option<u32>,
    height: Option<u32>,
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_rotation(degrees: u32) -> CaptureResult<Rotation> {
    Rotation::from_degrees(degrees)
        .ok_or_else(|| CaptureError::config(format!("invalid display rotation: {}", degrees)))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(None),
    }
}
