//! Runtime configuration: optional TOML file, then `ROOMWATCH_*` environment overrides.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::occupancy::DEFAULT_NO_FACE_TIMEOUT;
use crate::processor::{ProcessorSettings, DEFAULT_FRAME_SKIP, DEFAULT_RESIZE_FACTOR};
use crate::types::DEFAULT_MATCH_TOLERANCE;

const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_DETECTION_MODEL: &str = "det_10g";
const DEFAULT_RECOGNITION_MODEL: &str = "w600k_r50";
const DEFAULT_WARMUP_FRAMES: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    store_path: Option<PathBuf>,
    detection_model: Option<String>,
    recognition_model: Option<String>,
    match_tolerance: Option<f32>,
    resize_factor: Option<f32>,
    frame_skip: Option<u64>,
    no_face_timeout_secs: Option<f64>,
    warmup_frames: Option<usize>,
    preview_path: Option<PathBuf>,
    telegram: Option<TelegramFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TelegramFile {
    bot_token: Option<String>,
    chat_id: Option<String>,
}

/// Credentials for the Telegram alert channel.
#[derive(Clone, PartialEq)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

impl fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Runtime configuration shared by the daemon and the CLI.
///
/// Loaded from an optional TOML file named by `ROOMWATCH_CONFIG`, then
/// overridden by `ROOMWATCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the known-face encoding store.
    pub store_path: PathBuf,
    /// Detector model file stem inside `model_dir`.
    pub detection_model: String,
    /// Recognizer model file stem inside `model_dir`.
    pub recognition_model: String,
    /// Maximum encoding distance counted as a match.
    pub match_tolerance: f32,
    /// Downscale factor applied before detection.
    pub resize_factor: f32,
    /// Evaluate every Nth captured frame.
    pub frame_skip: u64,
    pub no_face_timeout: Duration,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Where to write the latest annotated frame, if anywhere.
    pub preview_path: Option<PathBuf>,
    pub telegram: Option<TelegramSettings>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ROOMWATCH_CONFIG") {
            Some(path) => read_config_file(Path::new(&path))?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let data_dir = default_data_dir();
        let telegram = file.telegram.unwrap_or_default();
        let no_face_timeout = match file.no_face_timeout_secs {
            Some(secs) => timeout_from_secs("no_face_timeout_secs", secs)?,
            None => DEFAULT_NO_FACE_TIMEOUT,
        };

        Ok(Self {
            camera_device: file
                .camera_device
                .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
            model_dir: file.model_dir.unwrap_or_else(|| data_dir.join("models")),
            store_path: file
                .store_path
                .unwrap_or_else(|| data_dir.join("encodings.json")),
            detection_model: file
                .detection_model
                .unwrap_or_else(|| DEFAULT_DETECTION_MODEL.to_string()),
            recognition_model: file
                .recognition_model
                .unwrap_or_else(|| DEFAULT_RECOGNITION_MODEL.to_string()),
            match_tolerance: file.match_tolerance.unwrap_or(DEFAULT_MATCH_TOLERANCE),
            resize_factor: file.resize_factor.unwrap_or(DEFAULT_RESIZE_FACTOR),
            frame_skip: file.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
            no_face_timeout,
            warmup_frames: file.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
            preview_path: file.preview_path,
            telegram: telegram_settings(telegram.bot_token, telegram.chat_id),
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("ROOMWATCH_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = std::env::var_os("ROOMWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("ROOMWATCH_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROOMWATCH_DETECTION_MODEL") {
            self.detection_model = v;
        }
        if let Ok(v) = std::env::var("ROOMWATCH_RECOGNITION_MODEL") {
            self.recognition_model = v;
        }
        if let Some(v) = env_parse("ROOMWATCH_MATCH_TOLERANCE")? {
            self.match_tolerance = v;
        }
        if let Some(v) = env_parse("ROOMWATCH_RESIZE_FACTOR")? {
            self.resize_factor = v;
        }
        if let Some(v) = env_parse("ROOMWATCH_FRAME_SKIP")? {
            self.frame_skip = v;
        }
        if let Some(secs) = env_parse("ROOMWATCH_NO_FACE_TIMEOUT_SECS")? {
            self.no_face_timeout = timeout_from_secs("ROOMWATCH_NO_FACE_TIMEOUT_SECS", secs)?;
        }
        if let Some(v) = env_parse("ROOMWATCH_WARMUP_FRAMES")? {
            self.warmup_frames = v;
        }
        if let Some(v) = std::env::var_os("ROOMWATCH_PREVIEW_PATH") {
            self.preview_path = Some(PathBuf::from(v));
        }

        let token = std::env::var("ROOMWATCH_TELEGRAM_TOKEN").ok();
        let chat_id = std::env::var("ROOMWATCH_TELEGRAM_CHAT_ID").ok();
        if token.is_some() || chat_id.is_some() {
            let current = self.telegram.take();
            self.telegram = telegram_settings(
                token.or_else(|| current.as_ref().map(|t| t.bot_token.clone())),
                chat_id.or_else(|| current.map(|t| t.chat_id)),
            );
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.resize_factor > 0.0 && self.resize_factor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "resize_factor must be in (0, 1], got {}",
                self.resize_factor
            )));
        }
        if self.frame_skip == 0 {
            return Err(ConfigError::Invalid("frame_skip must be at least 1".into()));
        }
        if !(self.match_tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_tolerance must be positive, got {}",
                self.match_tolerance
            )));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_path(&self.detection_model)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_path(&self.recognition_model)
    }

    fn model_path(&self, stem: &str) -> String {
        self.model_dir
            .join(format!("{stem}.onnx"))
            .to_string_lossy()
            .into_owned()
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            resize_factor: self.resize_factor,
            frame_skip: self.frame_skip,
            no_face_timeout: self.no_face_timeout,
            match_tolerance: self.match_tolerance,
        }
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Negative or non-finite seconds are rejected rather than clamped.
fn timeout_from_secs(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: secs.to_string(),
    })
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            PathBuf::from(home).join(".local/share")
        })
        .join("roomwatch")
}

fn telegram_settings(
    bot_token: Option<String>,
    chat_id: Option<String>,
) -> Option<TelegramSettings> {
    match (bot_token, chat_id) {
        (Some(bot_token), Some(chat_id)) if !bot_token.is_empty() && !chat_id.is_empty() => {
            Some(TelegramSettings { bot_token, chat_id })
        }
        _ => None,
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
