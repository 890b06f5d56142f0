use clap::Parser;

use super::*;
use crate::domain::types::DitheringType;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.limits.max_map_area.get(), DEFAULT_MAX_MAP_AREA);
    assert_eq!(
        settings.limits.max_file_size_bytes.get(),
        DEFAULT_MAX_FILE_SIZE_BYTES
    );
    assert!(settings.limits.require_empty_maps);
    assert_eq!(settings.limits.default_creation_limit, 0);
    assert!(settings.sources.allowed_hosts.is_empty());
    assert!(settings.uploads.enabled);
    assert_eq!(
        settings.uploads.timeout,
        Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS)
    );
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.limits.max_map_area = Some(16);
    raw.logging.level = Some("info".to_string());

    let overrides = CreateOverrides {
        max_map_area: Some(64),
        log_level: Some("debug".to_string()),
        uploads_enabled: Some(false),
        ..Default::default()
    };

    raw.apply_create_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.limits.max_map_area.get(), 64);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(!settings.uploads.enabled);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = CreateOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_create_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_limits_are_rejected() {
    let mut raw = RawSettings::default();
    raw.limits.max_map_area = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "limits.max_map_area",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.pipeline.max_concurrent_jobs = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "pipeline.max_concurrent_jobs",
            ..
        }
    ));
}

#[test]
fn creation_limits_are_keyed_by_actor_id() {
    let actor = Uuid::new_v4();
    let mut raw = RawSettings::default();
    raw.limits.creation_limits = HashMap::from([(actor.to_string(), 3)]);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.limits.creation_limits.get(&ActorId::new(actor)),
        Some(&3)
    );

    let mut raw = RawSettings::default();
    raw.limits.creation_limits = HashMap::from([("steve".to_string(), 3)]);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "limits.creation_limits",
            ..
        }
    ));
}

#[test]
fn invalid_log_level_is_reported() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn allowed_hosts_drop_blank_entries() {
    let mut raw = RawSettings::default();
    raw.sources.allowed_hosts = Some(vec![" imgur.com ".to_string(), "  ".to_string()]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.sources.allowed_hosts, vec!["imgur.com".to_string()]);
}

#[test]
fn parse_create_arguments() {
    let actor = Uuid::new_v4();
    let args = CliArgs::parse_from([
        "mapforge",
        "create",
        "http://x/img.png",
        "--width",
        "2",
        "--height",
        "3",
        "--name",
        "A",
        "--actor",
        &actor.to_string(),
        "--combined",
        "--dithering",
        "floyd-steinberg",
        "--uploads-enabled",
        "false",
    ]);

    match args.command {
        Command::Create(create) => {
            assert_eq!(create.source, "http://x/img.png");
            assert_eq!((create.width, create.height), (2, 3));
            assert_eq!(create.name, "A");
            assert_eq!(create.actor, Some(actor));
            assert!(create.combined);
            assert_eq!(create.dithering, DitheringType::FloydSteinberg);
            assert_eq!(create.empty_maps, None);
            assert_eq!(create.overrides.uploads_enabled, Some(false));
        }
    }
}

#[test]
fn parse_upload_arguments() {
    let args = CliArgs::parse_from([
        "mapforge",
        "create",
        "upload",
        "--width",
        "1",
        "--height",
        "1",
        "--name",
        "up",
        "--upload-file",
        "/tmp/cat.gif",
        "--empty-maps",
        "5",
    ]);

    match args.command {
        Command::Create(create) => {
            assert_eq!(create.source, "upload");
            assert_eq!(
                create.upload_file.as_deref(),
                Some(std::path::Path::new("/tmp/cat.gif"))
            );
            assert_eq!(create.empty_maps, Some(5));
            assert_eq!(create.dithering, DitheringType::NearestColor);
        }
    }
}
