use std::{path::Path, process, sync::Arc};

use bytes::Bytes;
use mapforge::{
    application::{
        collaborators::{MapBuilders, UploadResolver},
        creation::{CreationSettings, CreatorParts, ImageMapCreator},
        error::{AppError, error_chain},
        reservation::UnitReserver,
        tasks::CreationTaskManager,
        validator::{CreationValidator, ValidationLimits},
    },
    config::{self, CreateArgs, Settings},
    domain::{
        entities::{CreationRequest, ImageMap},
        types::{ActorId, DeliveryMode, MapKind, OwnerId},
    },
    infra::{
        builder::FetchingMapBuilder,
        error::InfraError,
        memory::{DeliveredItem, InMemoryInventory, InMemoryMapRegistry},
        policy::SettingsPolicy,
        remote::RemoteContent,
        telemetry,
        uploads::{UploadSessions, UploadStorage},
    },
};
use serde::Serialize;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let chain = error_chain(error);
    for (depth, message) in chain.iter().enumerate() {
        if depth == 0 {
            eprintln!("error: {message}");
        } else {
            eprintln!("  caused by: {message}");
        }
    }

    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?chain, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Create(args) => run_create(settings, *args).await,
    }
}

#[derive(Serialize)]
struct CreationReport {
    map: ImageMap,
    delivered: Vec<DeliveredItem>,
    empty_maps_left: u64,
}

struct Runtime {
    creator: ImageMapCreator,
    inventory: Arc<InMemoryInventory>,
    uploads: Option<Arc<UploadSessions>>,
}

fn build_runtime(settings: &Settings) -> Result<Runtime, InfraError> {
    let max_file_size = settings.limits.max_file_size_bytes.get();
    let content = Arc::new(RemoteContent::new(
        settings.pipeline.fetch_timeout,
        max_file_size,
    )?);
    let registry = Arc::new(InMemoryMapRegistry::new());
    let inventory = Arc::new(InMemoryInventory::new());
    let policy = Arc::new(SettingsPolicy::new(
        settings.sources.allowed_hosts.clone(),
        settings.limits.default_creation_limit,
        settings.limits.creation_limits.clone(),
    ));

    let uploads = if settings.uploads.enabled {
        let storage = UploadStorage::new(settings.uploads.directory.clone(), max_file_size)?;
        Some(Arc::new(UploadSessions::new(
            storage,
            settings.uploads.timeout,
        )))
    } else {
        None
    };

    let validator = CreationValidator::new(
        ValidationLimits {
            max_map_area: settings.limits.max_map_area.get(),
            max_name_length: settings.limits.max_name_length.get() as usize,
        },
        policy,
        registry.clone(),
    );
    let builders = MapBuilders::new(
        Arc::new(FetchingMapBuilder::new(content.clone(), MapKind::Static)),
        Arc::new(FetchingMapBuilder::new(content.clone(), MapKind::Animated)),
    );

    let creator = ImageMapCreator::new(
        CreatorParts {
            validator,
            reserver: UnitReserver::new(inventory.clone(), settings.limits.require_empty_maps),
            registry,
            uploads: uploads
                .clone()
                .map(|sessions| sessions as Arc<dyn UploadResolver>),
            prober: content,
            builders,
            delivery: inventory.clone(),
            tasks: CreationTaskManager::new(settings.pipeline.task_history.get() as usize),
        },
        CreationSettings {
            max_file_size,
            max_concurrent_jobs: settings.pipeline.max_concurrent_jobs.get() as usize,
        },
    );

    Ok(Runtime {
        creator,
        inventory,
        uploads,
    })
}

async fn run_create(settings: Settings, args: CreateArgs) -> Result<(), AppError> {
    let runtime = build_runtime(&settings)?;

    let actor = ActorId::new(args.actor.unwrap_or_else(Uuid::new_v4));
    let owner = args.owner.map(OwnerId::new).unwrap_or_else(|| actor.as_owner());
    let request = CreationRequest::new(&args.source, args.width, args.height, &args.name, owner)
        .with_actor(actor)
        .with_delivery(DeliveryMode::from_combined(args.combined))
        .with_dithering(args.dithering);

    let granted = args.empty_maps.unwrap_or_else(|| request.required_units());
    runtime.inventory.grant_units(actor, granted);
    info!(
        target = "mapforge::create",
        actor = %actor,
        owner = %owner,
        empty_maps = granted,
        "submitting image map request"
    );

    let mut handle = runtime.creator.submit(request).await;
    if let (Some(path), Some(sessions)) = (args.upload_file.as_deref(), runtime.uploads.as_ref()) {
        tokio::select! {
            outcome = &mut handle => {
                return print_report(outcome?, &runtime.inventory, actor);
            }
            () = sessions.session_opened(owner) => {
                supply_upload(sessions, owner, path).await?;
            }
        }
    }

    let map = handle.await?;
    print_report(map, &runtime.inventory, actor)
}

async fn supply_upload(
    sessions: &UploadSessions,
    owner: OwnerId,
    path: &Path,
) -> Result<(), AppError> {
    let data = tokio::fs::read(path).await.map_err(InfraError::from)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload");
    sessions
        .store_and_supply(owner, name, Bytes::from(data))
        .await
        .map_err(|err| AppError::unexpected(format!("failed to supply upload: {err}")))?;
    Ok(())
}

fn print_report(
    map: ImageMap,
    inventory: &InMemoryInventory,
    actor: ActorId,
) -> Result<(), AppError> {
    let report = CreationReport {
        map,
        delivered: inventory.items(actor),
        empty_maps_left: inventory.units(actor),
    };
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(format!("failed to render report: {err}")))?;
    println!("{rendered}");
    Ok(())
}

