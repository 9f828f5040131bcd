// SPDX-License-Identifier: GPL-3.0-only

//! Persisted settings records
//!
//! Both records are immutable values: every change produces a new record
//! from the old one. They are stored as JSON with camelCase keys; missing
//! fields take their defaults and unknown fields are ignored.

use crate::constants::{
    DEFAULT_FPS_RANGE, DEFAULT_LISTEN_ON_ALL_INTERFACES, DEFAULT_PORT, DEFAULT_QUALITY,
    DEFAULT_RESOLUTION, MAX_QUALITY, MIN_QUALITY, RESERVED_PORT_MAX,
};
use crate::errors::SettingsError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A settings record that can be persisted through a `SettingsStore`
pub trait SettingsRecord:
    Serialize + DeserializeOwned + Default + Clone + PartialEq + Send + Sync + 'static
{
    /// Storage key (file stem for file-backed stores)
    const KEY: &'static str;

    /// Check the record's invariants
    fn validate(&self) -> Result<(), SettingsError>;

    /// Encode as JSON
    fn to_json(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate a stored record
    fn from_json(json: &str) -> Result<Self, SettingsError> {
        let record: Self = serde_json::from_str(json)?;
        record.validate()?;
        Ok(record)
    }

    /// Decode a stored record, falling back to the default record when the
    /// stored value is corrupt or invalid
    fn from_json_or_default(json: &str) -> Self {
        match Self::from_json(json) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = Self::KEY, error = %e, "Stored settings unreadable, using defaults");
                Self::default()
            }
        }
    }
}

/// Network settings for the broadcast server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// TCP port (1-65535)
    pub port: u16,
    /// Bind to every interface instead of the current local address
    pub listen_on_all_interfaces: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            listen_on_all_interfaces: DEFAULT_LISTEN_ON_ALL_INTERFACES,
        }
    }
}

impl ServerSettings {
    /// Ports 1-1024 are flagged to the user but still accepted
    pub fn is_reserved_port(&self) -> bool {
        (1..=RESERVED_PORT_MAX).contains(&self.port)
    }
}

impl SettingsRecord for ServerSettings {
    const KEY: &'static str = "server_settings";

    fn validate(&self) -> Result<(), SettingsError> {
        if self.port == 0 {
            return Err(SettingsError::Invalid("port must be in 1-65535".into()));
        }
        Ok(())
    }
}

/// Capture resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLUTION.0, DEFAULT_RESOLUTION.1)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    /// Parse `WIDTHxHEIGHT`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let width = w.trim().parse().map_err(|_| format!("invalid width '{}'", w))?;
        let height = h.trim().parse().map_err(|_| format!("invalid height '{}'", h))?;
        Ok(Self::new(width, height))
    }
}

/// Auto-exposure frame-rate range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FpsRange {
    pub lower: u32,
    pub upper: u32,
}

impl FpsRange {
    pub fn new(lower: u32, upper: u32) -> Self {
        Self { lower, upper }
    }

    pub fn is_valid(&self) -> bool {
        self.lower <= self.upper && self.upper > 0
    }
}

impl Default for FpsRange {
    fn default() -> Self {
        Self::new(DEFAULT_FPS_RANGE.0, DEFAULT_FPS_RANGE.1)
    }
}

impl std::fmt::Display for FpsRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.lower, self.upper)
    }
}

impl std::str::FromStr for FpsRange {
    type Err = String;

    /// Parse `LOWER-UPPER` or a single fixed rate
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid frame rate '{}'", v))
        };
        let range = match s.split_once('-') {
            Some((lower, upper)) => Self::new(parse(lower)?, parse(upper)?),
            None => {
                let fps = parse(s)?;
                Self::new(fps, fps)
            }
        };
        if range.is_valid() {
            Ok(range)
        } else {
            Err(format!("invalid frame-rate range '{}'", s))
        }
    }
}

/// Which physical camera supplies frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CameraFacing {
    Front,
    #[default]
    Back,
}

impl std::fmt::Display for CameraFacing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraFacing::Front => write!(f, "front"),
            CameraFacing::Back => write!(f, "back"),
        }
    }
}

/// How the preview fills its viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentScale {
    #[default]
    Crop,
    Fit,
}

/// Capture and encoding settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraSettings {
    #[serde(rename = "cameraResolution")]
    pub resolution: Resolution,
    #[serde(rename = "selectedFpsRangeFrontCam")]
    pub fps_range_front: FpsRange,
    #[serde(rename = "selectedFpsRangeBackCam")]
    pub fps_range_back: FpsRange,
    /// JPEG quality (1-100)
    pub quality: u8,
    #[serde(rename = "cameraFacing")]
    pub facing: CameraFacing,
    pub rotate_image: bool,
    #[serde(rename = "cameraContentScale")]
    pub content_scale: ContentScale,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            fps_range_front: FpsRange::default(),
            fps_range_back: FpsRange::default(),
            quality: DEFAULT_QUALITY,
            facing: CameraFacing::default(),
            rotate_image: false,
            content_scale: ContentScale::default(),
        }
    }
}

impl CameraSettings {
    /// The fps range chosen for the currently selected camera
    pub fn selected_fps_range(&self) -> FpsRange {
        match self.facing {
            CameraFacing::Front => self.fps_range_front,
            CameraFacing::Back => self.fps_range_back,
        }
    }
}

impl SettingsRecord for CameraSettings {
    const KEY: &'static str = "camera_settings";

    fn validate(&self) -> Result<(), SettingsError> {
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&self.quality) {
            return Err(SettingsError::Invalid(format!(
                "quality {} outside {}-{}",
                self.quality, MIN_QUALITY, MAX_QUALITY
            )));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(SettingsError::Invalid(format!(
                "resolution {} has a zero dimension",
                self.resolution
            )));
        }
        for range in [self.fps_range_front, self.fps_range_back] {
            if !range.is_valid() {
                return Err(SettingsError::Invalid(format!("fps range {} is invalid", range)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_settings_round_trip() {
        let settings = ServerSettings {
            port: 8080,
            listen_on_all_interfaces: false,
        };
        let json = settings.to_json().unwrap();
        assert_eq!(json, r#"{"port":8080,"listenOnAllInterfaces":false}"#);
        assert_eq!(ServerSettings::from_json(&json).unwrap(), settings);
    }

    #[test]
    fn test_corrupt_record_falls_back_to_default() {
        assert_eq!(
            ServerSettings::from_json_or_default("{\"port\": \"eighty\""),
            ServerSettings::default()
        );
        assert_eq!(
            ServerSettings::from_json_or_default(r#"{"port":0}"#),
            ServerSettings::default()
        );
        assert_eq!(
            CameraSettings::from_json_or_default(r#"{"quality":250}"#),
            CameraSettings::default()
        );
    }

    #[test]
    fn test_missing_and_unknown_fields() {
        let settings =
            CameraSettings::from_json(r#"{"quality":40,"someFutureField":true}"#).unwrap();
        assert_eq!(settings.quality, 40);
        assert_eq!(settings.resolution, Resolution::default());
    }

    #[test]
    fn test_camera_settings_wire_names() {
        let json = CameraSettings::default().to_json().unwrap();
        assert!(json.contains("\"cameraResolution\":{\"width\":640,\"height\":480}"));
        assert!(json.contains("\"cameraFacing\":\"BACK\""));
        assert!(json.contains("\"cameraContentScale\":\"CROP\""));
        assert!(json.contains("\"selectedFpsRangeFrontCam\""));
        assert!(json.contains("\"rotateImage\":false"));
    }

    #[test]
    fn test_selected_fps_range_follows_facing() {
        let mut settings = CameraSettings {
            fps_range_front: FpsRange::new(15, 30),
            fps_range_back: FpsRange::new(30, 60),
            ..Default::default()
        };
        assert_eq!(settings.selected_fps_range(), FpsRange::new(30, 60));
        settings.facing = CameraFacing::Front;
        assert_eq!(settings.selected_fps_range(), FpsRange::new(15, 30));
    }

    #[test]
    fn test_reserved_ports() {
        assert!(ServerSettings { port: 80, ..Default::default() }.is_reserved_port());
        assert!(!ServerSettings::default().is_reserved_port());
    }

    #[test]
    fn test_parse_cli_values() {
        assert_eq!("1280x720".parse::<Resolution>().unwrap(), Resolution::new(1280, 720));
        assert_eq!("15-30".parse::<FpsRange>().unwrap(), FpsRange::new(15, 30));
        assert_eq!("24".parse::<FpsRange>().unwrap(), FpsRange::new(24, 24));
        assert!("30-15".parse::<FpsRange>().is_err());
    }
}
