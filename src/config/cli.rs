use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use uuid::Uuid;

use crate::domain::types::DitheringType;

/// Command-line arguments for the mapforge binary.
#[derive(Debug, Parser)]
#[command(
    name = "mapforge",
    version,
    about = "Turn remote or uploaded images into tiled image maps"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MAPFORGE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Create one image map and print it as JSON.
    Create(Box<CreateArgs>),
}

#[derive(Debug, Args, Clone)]
pub struct CreateArgs {
    /// Image location (http, https or file URL), or `upload` to use --upload-file.
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Map width in tiles.
    #[arg(long, value_name = "TILES")]
    pub width: u32,

    /// Map height in tiles.
    #[arg(long, value_name = "TILES")]
    pub height: u32,

    /// Map name, unique per owner.
    #[arg(long, value_name = "NAME")]
    pub name: String,

    /// Owner of the map; defaults to the actor.
    #[arg(long, value_name = "UUID")]
    pub owner: Option<Uuid>,

    /// Actor requesting the map; a random one is used when omitted.
    #[arg(long, value_name = "UUID")]
    pub actor: Option<Uuid>,

    /// Empty maps the actor holds before the request; defaults to exactly what is needed.
    #[arg(long = "empty-maps", value_name = "COUNT")]
    pub empty_maps: Option<u64>,

    /// Deliver a single combined item instead of one item per tile.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub combined: bool,

    /// Dithering algorithm (nearest-color|floyd-steinberg).
    #[arg(long, value_name = "TYPE", default_value = "nearest-color")]
    pub dithering: DitheringType,

    /// File handed to the upload session when SOURCE is `upload`.
    #[arg(long = "upload-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub upload_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: CreateOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CreateOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the maximum map area in tiles.
    #[arg(long = "limits-max-map-area", value_name = "TILES")]
    pub max_map_area: Option<u64>,

    /// Override the maximum source file size in bytes.
    #[arg(long = "limits-max-file-size-bytes", value_name = "BYTES")]
    pub max_file_size_bytes: Option<u64>,

    /// Toggle whether empty maps are consumed.
    #[arg(
        long = "limits-require-empty-maps",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub require_empty_maps: Option<bool>,

    /// Toggle the upload subsystem.
    #[arg(
        long = "uploads-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub uploads_enabled: Option<bool>,

    /// Override the uploads directory.
    #[arg(long = "uploads-directory", value_name = "PATH")]
    pub uploads_directory: Option<PathBuf>,

    /// Override how long a creation waits for its upload.
    #[arg(long = "uploads-timeout-seconds", value_name = "SECONDS")]
    pub uploads_timeout_seconds: Option<u64>,

    /// Override the fetch timeout for remote images.
    #[arg(long = "pipeline-fetch-timeout-seconds", value_name = "SECONDS")]
    pub fetch_timeout_seconds: Option<u64>,
}
