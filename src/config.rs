// src/config.rs

//! Configuration for `kmsdisplay`.
//!
//! Settings are grouped into sections that deserialize from a JSON file. Every
//! field has a default, so a file only needs the keys it changes:
//!
//! ```json
//! { "device": { "path": "/dev/dri/card1" }, "release": { "timeout_ms": 5000 } }
//! ```
//!
//! Layering is defaults, then the file, then the `KMSDISPLAY_DEVICE`
//! environment variable. Command-line flags are applied on top by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::kms::{BufferUsage, PixelFormat};
use crate::pipeline::PipelineSettings;
use crate::probe::ProbeRequest;
use crate::render::RenderPattern;

/// Environment variable overriding [`DeviceConfig::path`].
pub const DEVICE_ENV: &str = "KMSDISPLAY_DEVICE";

/// Colour the allocation probe fills with when no solid colour is configured.
pub const PROBE_COLOR: u32 = 0x00FF_0000;

// --- Top-Level Configuration Structure ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub buffer: BufferConfig,
    pub release: ReleaseConfig,
    pub render: RenderConfig,
    pub probe: ProbeConfig,
}

// --- Device ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// DRM card node to drive.
    pub path: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            path: PathBuf::from("/dev/dri/card0"),
        }
    }
}

// --- Buffer ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BufferConfig {
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

// --- Release ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Release automatically after this many milliseconds.
    pub timeout_ms: Option<u64>,
    /// A line (or end of file) on stdin releases the display.
    pub on_input: bool,
    /// SIGINT, SIGTERM and SIGHUP release the display instead of killing
    /// the process.
    pub on_signals: bool,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        ReleaseConfig {
            timeout_ms: None,
            on_input: true,
            on_signals: true,
        }
    }
}

impl ReleaseConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

// --- Render ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RenderConfig {
    pub pattern: RenderPattern,
}

// --- Probe ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            width: 1280,
            height: 720,
        }
    }
}

impl Config {
    /// Defaults, overlaid with `path` when given, overlaid with the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Applies environment overrides, looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(DEVICE_ENV).filter(|p| !p.is_empty()) {
            debug!("{} overrides device path with {}", DEVICE_ENV, path);
            self.device.path = PathBuf::from(path);
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            device_path: self.device.path.clone(),
            format: self.buffer.format,
            usage: self.buffer.usage,
        }
    }

    /// The probe fills with the configured solid colour, or red otherwise.
    pub fn probe_request(&self) -> ProbeRequest {
        let color = match self.render.pattern {
            RenderPattern::Solid { color } => color,
            RenderPattern::Gradient => PROBE_COLOR,
        };
        ProbeRequest {
            width: self.probe.width,
            height: self.probe.height,
            format: self.buffer.format,
            usage: self.buffer.usage,
            color,
        }
    }
}

/// Parses `RRGGBB`, `#RRGGBB` or `0xRRGGBB`.
pub fn parse_color(text: &str) -> Result<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .or_else(|| text.strip_prefix('#'))
        .unwrap_or(text);
    if digits.is_empty() || digits.len() > 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("colour {text:?} must be up to six hex digits");
    }
    u32::from_str_radix(digits, 16).with_context(|| format!("colour {text:?} is not hex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.device.path, PathBuf::from("/dev/dri/card0"));
        assert_eq!(config.buffer.format, PixelFormat::Xrgb8888);
        assert_eq!(config.buffer.usage, BufferUsage::SCANOUT | BufferUsage::RENDERING);
        assert!(config.release.on_input && config.release.on_signals);
        assert_eq!(config.release.timeout(), None);
        assert_eq!(config.render.pattern, RenderPattern::Gradient);
        assert_eq!((config.probe.width, config.probe.height), (1280, 720));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config = Config::from_json(
            r#"{ "device": { "path": "/dev/dri/card1" }, "release": { "timeout_ms": 250 } }"#,
        )
        .unwrap();
        assert_eq!(config.device.path, PathBuf::from("/dev/dri/card1"));
        assert_eq!(config.release.timeout(), Some(Duration::from_millis(250)));
        assert!(config.release.on_input);
        assert_eq!(config.probe, ProbeConfig::default());
    }

    #[test]
    fn format_and_pattern_parse_from_json() {
        let config = Config::from_json(
            r#"{ "buffer": { "format": "argb8888" },
                 "render": { "pattern": { "kind": "solid", "color": 65280 } } }"#,
        )
        .unwrap();
        assert_eq!(config.buffer.format, PixelFormat::Argb8888);
        assert_eq!(config.probe_request().color, 0x00FF00);
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(Config::from_json(r#"{ "buffer": { "format": "rgb565" } }"#).is_err());
    }

    #[test]
    fn environment_overrides_file() {
        let mut file = scratch_file("env_overrides_file.json");
        write!(file.1, r#"{{ "device": {{ "path": "/dev/dri/card1" }} }}"#).unwrap();

        let mut config = Config::from_file(&file.0).unwrap();
        config.apply_env(|name| (name == DEVICE_ENV).then(|| "/dev/dri/card7".to_string()));
        assert_eq!(config.device.path, PathBuf::from("/dev/dri/card7"));

        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.device.path, PathBuf::from("/dev/dri/card7"));
        let _ = fs::remove_file(&file.0);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = Config::from_file(Path::new("/nonexistent/kmsdisplay.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/kmsdisplay.json"));
    }

    #[test]
    fn probe_defaults_to_red() {
        assert_eq!(Config::default().probe_request().color, PROBE_COLOR);
    }

    #[test]
    fn colours_parse_with_or_without_prefix() {
        assert_eq!(parse_color("FF0000").unwrap(), 0xFF0000);
        assert_eq!(parse_color("#00ff00").unwrap(), 0x00FF00);
        assert_eq!(parse_color("0x0000FF").unwrap(), 0x0000FF);
        assert!(parse_color("").is_err());
        assert!(parse_color("1234567").is_err());
        assert!(parse_color("zz").is_err());
    }

    #[test]
    fn colour_sign_is_not_a_hex_digit() {
        assert!(parse_color("+FF").is_err());
        assert!(parse_color("#+FF").is_err());
        assert!(parse_color("-1").is_err());
    }

    fn scratch_file(name: &str) -> (PathBuf, fs::File) {
        let path = std::env::temp_dir().join(format!("kmsdisplay-{}-{}", std::process::id(), name));
        let file = fs::File::create(&path).unwrap();
        (path, file)
    }
}
