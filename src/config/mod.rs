//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashMap,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

use crate::domain::types::ActorId;

mod cli;

pub use cli::{CliArgs, Command, CreateArgs, CreateOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mapforge";
const DEFAULT_MAX_MAP_AREA: u64 = 256;
const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_NAME_LENGTH: u64 = 64;
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_CONCURRENT_JOBS: u32 = 4;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TASK_HISTORY: u32 = 64;

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub limits: LimitSettings,
    pub sources: SourceSettings,
    pub uploads: UploadSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct LimitSettings {
    pub max_map_area: NonZeroU64,
    pub max_file_size_bytes: NonZeroU64,
    pub max_name_length: NonZeroU32,
    pub require_empty_maps: bool,
    /// Values `<= 0` mean unlimited.
    pub default_creation_limit: i64,
    pub creation_limits: HashMap<ActorId, i64>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Empty allows every host.
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_concurrent_jobs: NonZeroU32,
    pub fetch_timeout: Duration,
    pub task_history: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse the process arguments and load settings for them.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("MAPFORGE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("sources.allowed_hosts")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Create(args) => raw.apply_create_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    limits: RawLimitSettings,
    sources: RawSourceSettings,
    uploads: RawUploadSettings,
    pipeline: RawPipelineSettings,
}

impl RawSettings {
    fn apply_create_overrides(&mut self, overrides: &CreateOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(area) = overrides.max_map_area {
            self.limits.max_map_area = Some(area);
        }
        if let Some(bytes) = overrides.max_file_size_bytes {
            self.limits.max_file_size_bytes = Some(bytes);
        }
        if let Some(required) = overrides.require_empty_maps {
            self.limits.require_empty_maps = Some(required);
        }
        if let Some(enabled) = overrides.uploads_enabled {
            self.uploads.enabled = Some(enabled);
        }
        if let Some(directory) = overrides.uploads_directory.as_ref() {
            self.uploads.directory = Some(directory.clone());
        }
        if let Some(seconds) = overrides.uploads_timeout_seconds {
            self.uploads.timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.fetch_timeout_seconds {
            self.pipeline.fetch_timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            limits,
            sources,
            uploads,
            pipeline,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            limits: build_limit_settings(limits)?,
            sources: build_source_settings(sources),
            uploads: build_upload_settings(uploads)?,
            pipeline: build_pipeline_settings(pipeline)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_limit_settings(limits: RawLimitSettings) -> Result<LimitSettings, LoadError> {
    let max_map_area = NonZeroU64::new(limits.max_map_area.unwrap_or(DEFAULT_MAX_MAP_AREA))
        .ok_or_else(|| LoadError::invalid("limits.max_map_area", "must be greater than zero"))?;

    let max_file_size_bytes = NonZeroU64::new(
        limits
            .max_file_size_bytes
            .unwrap_or(DEFAULT_MAX_FILE_SIZE_BYTES),
    )
    .ok_or_else(|| LoadError::invalid("limits.max_file_size_bytes", "must be greater than zero"))?;

    let max_name_length = non_zero_u32(
        limits.max_name_length.unwrap_or(DEFAULT_MAX_NAME_LENGTH),
        "limits.max_name_length",
    )?;

    let creation_limits = limits
        .creation_limits
        .into_iter()
        .map(|(actor, limit)| {
            Uuid::parse_str(actor.trim())
                .map(|id| (ActorId::new(id), limit))
                .map_err(|err| {
                    LoadError::invalid(
                        "limits.creation_limits",
                        format!("`{actor}` is not an actor id: {err}"),
                    )
                })
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(LimitSettings {
        max_map_area,
        max_file_size_bytes,
        max_name_length,
        require_empty_maps: limits.require_empty_maps.unwrap_or(true),
        default_creation_limit: limits.default_creation_limit.unwrap_or(0),
        creation_limits,
    })
}

fn build_source_settings(sources: RawSourceSettings) -> SourceSettings {
    let allowed_hosts = sources
        .allowed_hosts
        .unwrap_or_default()
        .into_iter()
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
        .collect();
    SourceSettings { allowed_hosts }
}

fn build_upload_settings(uploads: RawUploadSettings) -> Result<UploadSettings, LoadError> {
    let directory = uploads
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "uploads.directory",
            "path must not be empty",
        ));
    }

    let timeout_seconds = uploads
        .timeout_seconds
        .unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "uploads.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UploadSettings {
        enabled: uploads.enabled.unwrap_or(true),
        directory,
        timeout: Duration::from_secs(timeout_seconds),
    })
}

fn build_pipeline_settings(pipeline: RawPipelineSettings) -> Result<PipelineSettings, LoadError> {
    let max_concurrent_jobs = non_zero_u32(
        pipeline
            .max_concurrent_jobs
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS)
            .into(),
        "pipeline.max_concurrent_jobs",
    )?;

    let fetch_timeout_seconds = pipeline
        .fetch_timeout_seconds
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
    if fetch_timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "pipeline.fetch_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let task_history = non_zero_u32(
        pipeline.task_history.unwrap_or(DEFAULT_TASK_HISTORY).into(),
        "pipeline.task_history",
    )?;

    Ok(PipelineSettings {
        max_concurrent_jobs,
        fetch_timeout: Duration::from_secs(fetch_timeout_seconds),
        task_history,
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value = u32::try_from(value)
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range"))?;
    NonZeroU32::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLimitSettings {
    max_map_area: Option<u64>,
    max_file_size_bytes: Option<u64>,
    max_name_length: Option<u64>,
    require_empty_maps: Option<bool>,
    default_creation_limit: Option<i64>,
    creation_limits: HashMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSourceSettings {
    allowed_hosts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUploadSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPipelineSettings {
    max_concurrent_jobs: Option<u32>,
    fetch_timeout_seconds: Option<u64>,
    task_history: Option<u32>,
}

#[cfg(test)]
mod tests;
