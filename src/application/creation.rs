//! Image map creation pipeline.
//!
//! Validation and unit reservation run on the caller so rejections are immediate. The rest
//! (upload wait, probes, admission, build, registration, delivery) runs as a background
//! task whose single outcome is delivered through a [`CreationHandle`]. The background task
//! runs the pipeline as a child task so that errors and panics both reach one finalization
//! block, which refunds units and stamps the task outcome.
//!
//! Pool slots are taken inside the admitted job, so a busy pool never holds back the
//! per-owner rejection.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll},
};

use metrics::counter;
use tokio::sync::{Semaphore, oneshot};
use tracing::{info, warn};

use crate::{
    application::{
        collaborators::{
            BuildError, BuildSpec, ContentProber, MapBuilders, MapDelivery, MapRegistry,
            UploadResolver,
        },
        error::{CreationError, PipelineError},
        reservation::{Reservation, UnitReserver},
        tasks::{
            CreationTaskManager, OUTCOME_FAILED, OUTCOME_SUCCESS, TaskParams, TaskTicket,
            panic_message,
        },
        validator::CreationValidator,
    },
    domain::{
        entities::{CreationRequest, ImageMap},
        source::SourceLocator,
        types::{ActorId, DeliveryMode, MapKind, normalize_content_type},
    },
    util::bytes::ByteSize,
};

#[derive(Debug, Clone, Copy)]
pub struct CreationSettings {
    pub max_file_size: u64,
    pub max_concurrent_jobs: usize,
}

/// Collaborators wired into an [`ImageMapCreator`].
pub struct CreatorParts {
    pub validator: CreationValidator,
    pub reserver: UnitReserver,
    pub registry: Arc<dyn MapRegistry>,
    /// `None` when the upload subsystem is disabled.
    pub uploads: Option<Arc<dyn UploadResolver>>,
    pub prober: Arc<dyn ContentProber>,
    pub builders: MapBuilders,
    pub delivery: Arc<dyn MapDelivery>,
    pub tasks: CreationTaskManager,
}

struct CreatorInner {
    validator: CreationValidator,
    reserver: UnitReserver,
    registry: Arc<dyn MapRegistry>,
    uploads: Option<Arc<dyn UploadResolver>>,
    prober: Arc<dyn ContentProber>,
    builders: MapBuilders,
    delivery: Arc<dyn MapDelivery>,
    tasks: CreationTaskManager,
    permits: Arc<Semaphore>,
    max_file_size: u64,
}

#[derive(Clone)]
pub struct ImageMapCreator {
    inner: Arc<CreatorInner>,
}

impl ImageMapCreator {
    pub fn new(parts: CreatorParts, settings: CreationSettings) -> Self {
        let CreatorParts {
            validator,
            reserver,
            registry,
            uploads,
            prober,
            builders,
            delivery,
            tasks,
        } = parts;

        Self {
            inner: Arc::new(CreatorInner {
                validator,
                reserver,
                registry,
                uploads,
                prober,
                builders,
                delivery,
                tasks,
                permits: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
                max_file_size: settings.max_file_size,
            }),
        }
    }

    pub fn tasks(&self) -> &CreationTaskManager {
        &self.inner.tasks
    }

    /// Accept or reject `request` on the calling task, then continue in the background.
    ///
    /// The returned handle resolves exactly once. Rejections are already resolved.
    pub async fn submit(&self, request: CreationRequest) -> CreationHandle {
        if let Err(err) = self.inner.validator.validate(&request).await {
            return rejected(&request, err.into());
        }

        let reservation = match self.inner.reserver.reserve(&request).await {
            Ok(reservation) => reservation,
            Err(err) => return rejected(&request, err.into()),
        };

        info!(
            target = "application::creation",
            owner = %request.owner,
            name = %request.name,
            dimensions = %request.dimensions,
            source = %request.source,
            delivery = request.delivery.as_str(),
            reserved_units = reservation.as_ref().map_or(0, Reservation::units),
            "image map request accepted"
        );

        let (sender, receiver) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.finalize(request, reservation).await;
            let _ = sender.send(outcome);
        });

        CreationHandle { receiver }
    }

    /// Submit and wait for the outcome.
    pub async fn create(&self, request: CreationRequest) -> Result<ImageMap, CreationError> {
        self.submit(request).await.await
    }

    /// Shortcut for an actor creating a map for itself with nearest-color dithering.
    pub async fn create_for_actor(
        &self,
        source: &str,
        width: u32,
        height: u32,
        name: &str,
        actor: ActorId,
        combined: bool,
    ) -> CreationHandle {
        self.submit(CreationRequest::for_actor(
            source, width, height, name, actor, combined,
        ))
        .await
    }
}

impl CreatorInner {
    async fn finalize(
        self: Arc<Self>,
        request: CreationRequest,
        reservation: Option<Reservation>,
    ) -> Result<ImageMap, CreationError> {
        let admitted = Arc::new(OnceLock::new());
        let pipeline = tokio::spawn(Arc::clone(&self).pipeline(request.clone(), admitted.clone()));

        let outcome = match pipeline.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                Err(PipelineError::build_failed(BuildError::Panicked(
                    panic_message(&*payload),
                )))
            }
            Err(_) => Err(PipelineError::build_failed(BuildError::Aborted)),
        };

        match outcome {
            Ok(map) => {
                if let Some(reservation) = reservation {
                    reservation.consume();
                }
                counter!("mapforge_creation_total", "outcome" => "success").increment(1);
                info!(
                    target = "application::creation",
                    owner = %request.owner,
                    map = %map.id,
                    name = %map.name,
                    kind = ?map.kind,
                    "image map created"
                );
                Ok(map)
            }
            Err(err) => {
                if let Some(reservation) = reservation {
                    self.reserver.refund(reservation).await;
                }
                if let Some(ticket) = admitted.get() {
                    ticket.complete(OUTCOME_FAILED);
                }

                let err = CreationError::from(err);
                counter!("mapforge_creation_total", "outcome" => err.kind()).increment(1);
                warn!(
                    target = "application::creation",
                    owner = %request.owner,
                    name = %request.name,
                    kind = err.kind(),
                    error = %err,
                    "image map creation failed"
                );
                Err(err)
            }
        }
    }

    async fn pipeline(
        self: Arc<Self>,
        request: CreationRequest,
        admitted: Arc<OnceLock<TaskTicket>>,
    ) -> Result<ImageMap, PipelineError> {
        let location = self.resolve_location(&request).await?;

        let size = self
            .prober
            .content_size(&location)
            .await
            .map_err(PipelineError::build_failed)?;
        if let Some(size) = size {
            if size > self.max_file_size {
                return Err(PipelineError::FileTooLarge {
                    size: ByteSize(size),
                    max: ByteSize(self.max_file_size),
                });
            }
        }

        let declared = self
            .prober
            .content_type(&location)
            .await
            .map_err(PipelineError::build_failed)?;
        let content_type = normalize_content_type(declared.as_deref());
        let kind = MapKind::from_content_type(&content_type);

        let builder = self.builders.for_kind(kind);
        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.permits);
        let spec = BuildSpec {
            name: request.name.clone(),
            location,
            dimensions: request.dimensions,
            dithering: request.dithering,
            owner: request.owner,
        };
        let params = TaskParams {
            name: request.name.clone(),
            dimensions: request.dimensions,
        };

        let task = self
            .tasks
            .enqueue(request.owner, params, move || async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| BuildError::Aborted)?;
                builder.build(registry, spec).await
            })
            .map_err(|rejected| PipelineError::EnqueueRejected {
                owner: rejected.owner,
            })?;
        let ticket = task.ticket();
        let _ = admitted.set(ticket.clone());

        let map = task.result().await?;
        self.registry
            .add(map.clone())
            .await
            .map_err(PipelineError::build_failed)?;

        if let Some(actor) = request.actor {
            let delivered = match request.delivery {
                DeliveryMode::Combined => self.delivery.deliver_combined(&map, actor).await,
                DeliveryMode::Individual => self.delivery.deliver_individual(&map, actor).await,
            };
            delivered.map_err(PipelineError::build_failed)?;
        }

        ticket.complete(OUTCOME_SUCCESS);
        Ok(map)
    }

    async fn resolve_location(&self, request: &CreationRequest) -> Result<String, PipelineError> {
        match &request.source {
            SourceLocator::Remote(location) => Ok(location.clone()),
            SourceLocator::Upload => {
                let Some(uploads) = self.uploads.as_ref() else {
                    return Err(PipelineError::UploadsDisabled);
                };
                let pending = uploads
                    .new_pending_upload(request.owner)
                    .await
                    .map_err(PipelineError::UploadFailed)?;
                info!(
                    target = "application::creation",
                    owner = %request.owner,
                    "waiting for upload"
                );
                pending.resolve().await.map_err(PipelineError::UploadFailed)
            }
        }
    }
}

fn rejected(request: &CreationRequest, err: CreationError) -> CreationHandle {
    counter!("mapforge_creation_total", "outcome" => err.kind()).increment(1);
    info!(
        target = "application::creation",
        owner = %request.owner,
        name = %request.name,
        reason = %err,
        "image map request rejected"
    );
    CreationHandle::resolved(Err(err))
}

/// Resolves once with the created map or the failure cause.
#[derive(Debug)]
pub struct CreationHandle {
    receiver: oneshot::Receiver<Result<ImageMap, CreationError>>,
}

impl CreationHandle {
    fn resolved(outcome: Result<ImageMap, CreationError>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(outcome);
        Self { receiver }
    }
}

impl Future for CreationHandle {
    type Output = Result<ImageMap, CreationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(CreationError::Pipeline(PipelineError::build_failed(
                    BuildError::Aborted,
                )))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::{
        application::{
            collaborators::{
                CreationLimit, CreationPolicy, MapBuilder, PendingUpload, ProbeError,
                UploadError,
            },
            error::ValidationError,
            validator::ValidationLimits,
        },
        domain::types::{Dimensions, OwnerId},
        infra::memory::{InMemoryInventory, InMemoryMapRegistry},
    };

    struct AllowAll;

    impl CreationPolicy for AllowAll {
        fn is_source_allowed(&self, _source: &SourceLocator) -> bool {
            true
        }

        fn creation_limit(&self, _actor: ActorId) -> CreationLimit {
            CreationLimit::from_raw(5)
        }
    }

    #[derive(Default)]
    struct StubProber {
        size: Option<u64>,
        content_type: Option<&'static str>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentProber for StubProber {
        async fn content_size(&self, location: &str) -> Result<Option<u64>, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProbeError::Transport {
                    location: location.to_string(),
                    message: "connection reset".to_string(),
                });
            }
            Ok(self.size)
        }

        async fn content_type(&self, _location: &str) -> Result<Option<String>, ProbeError> {
            Ok(self.content_type.map(str::to_string))
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct StubBuilder {
        kind: MapKind,
        behaviour: Behaviour,
        builds: AtomicUsize,
    }

    impl StubBuilder {
        fn new(kind: MapKind, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behaviour,
                builds: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MapBuilder for StubBuilder {
        async fn build(
            &self,
            registry: Arc<dyn MapRegistry>,
            spec: BuildSpec,
        ) -> Result<ImageMap, BuildError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => {
                    let tiles = registry.allocate_tiles(spec.dimensions.area()).await?;
                    Ok(ImageMap::new(
                        spec.name,
                        spec.owner,
                        spec.dimensions,
                        tiles,
                        self.kind,
                        spec.location,
                        spec.dithering,
                    )?)
                }
                Behaviour::Fail => Err(BuildError::Decode("not an image".to_string())),
                Behaviour::Panic => panic!("decoder crashed"),
            }
        }
    }

    struct NeverUploads;

    #[async_trait]
    impl UploadResolver for NeverUploads {
        async fn new_pending_upload(&self, owner: OwnerId) -> Result<PendingUpload, UploadError> {
            let (sender, receiver) = oneshot::channel();
            std::mem::forget(sender);
            Ok(PendingUpload::new(
                owner,
                receiver,
                Duration::from_millis(50),
            ))
        }
    }

    struct Harness {
        creator: ImageMapCreator,
        registry: Arc<InMemoryMapRegistry>,
        inventory: Arc<InMemoryInventory>,
        prober: Arc<StubProber>,
        static_builder: Arc<StubBuilder>,
        animated_builder: Arc<StubBuilder>,
    }

    fn harness(
        prober: StubProber,
        behaviour: Behaviour,
        uploads: Option<Arc<dyn UploadResolver>>,
    ) -> Harness {
        let registry = Arc::new(InMemoryMapRegistry::new());
        let inventory = Arc::new(InMemoryInventory::new());
        let prober = Arc::new(prober);
        let static_builder = StubBuilder::new(MapKind::Static, behaviour);
        let animated_builder = StubBuilder::new(MapKind::Animated, Behaviour::Succeed);

        let validator = CreationValidator::new(
            ValidationLimits {
                max_map_area: 64,
                max_name_length: 32,
            },
            Arc::new(AllowAll),
            registry.clone(),
        );
        let creator = ImageMapCreator::new(
            CreatorParts {
                validator,
                reserver: UnitReserver::new(inventory.clone(), true),
                registry: registry.clone(),
                uploads,
                prober: prober.clone(),
                builders: MapBuilders::new(static_builder.clone(), animated_builder.clone()),
                delivery: inventory.clone(),
                tasks: CreationTaskManager::new(16),
            },
            CreationSettings {
                max_file_size: 1024,
                max_concurrent_jobs: 4,
            },
        );

        Harness {
            creator,
            registry,
            inventory,
            prober,
            static_builder,
            animated_builder,
        }
    }

    fn png_prober() -> StubProber {
        StubProber {
            size: Some(100),
            content_type: Some("image/png"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn gif_content_type_uses_animated_builder() {
        let h = harness(
            StubProber {
                size: Some(100),
                content_type: Some(" image/gif "),
                ..Default::default()
            },
            Behaviour::Succeed,
            None,
        );
        let actor = ActorId::new(Uuid::new_v4());
        h.inventory.grant_units(actor, 4);

        let map = h
            .creator
            .create_for_actor("http://x/cat.gif", 2, 2, "cat", actor, true)
            .await
            .await
            .expect("created");

        assert!(map.is_animated());
        assert_eq!(h.animated_builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(h.static_builder.builds.load(Ordering::SeqCst), 0);
        assert_eq!(h.inventory.units(actor), 0);
        assert_eq!(h.inventory.items(actor).len(), 1);
    }

    #[tokio::test]
    async fn build_failure_refunds_units_and_marks_task_failed() {
        let h = harness(png_prober(), Behaviour::Fail, None);
        let actor = ActorId::new(Uuid::new_v4());
        h.inventory.grant_units(actor, 9);

        let err = h
            .creator
            .create_for_actor("http://x/img.png", 2, 2, "broken", actor, false)
            .await
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CreationError::Pipeline(PipelineError::BuildFailed(_))
        ));
        assert_eq!(h.inventory.units(actor), 9);
        assert_eq!(h.registry.count_by_owner(actor.as_owner()).await.unwrap(), 0);

        let recent = h.creator.tasks().recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(
            recent[0].status,
            crate::application::tasks::TaskStatus::Completed {
                outcome: OUTCOME_FAILED.to_string()
            }
        );
    }

    #[tokio::test]
    async fn builder_panic_still_resolves_and_refunds() {
        let h = harness(png_prober(), Behaviour::Panic, None);
        let actor = ActorId::new(Uuid::new_v4());
        h.inventory.grant_units(actor, 4);

        let err = h
            .creator
            .create_for_actor("http://x/img.png", 2, 2, "boom", actor, false)
            .await
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "build_failed");
        assert_eq!(h.inventory.units(actor), 4);
        assert!(!h.creator.tasks().is_active(actor.as_owner()));
    }

    #[tokio::test]
    async fn probe_failure_refunds_units() {
        let h = harness(
            StubProber {
                fail: true,
                ..Default::default()
            },
            Behaviour::Succeed,
            None,
        );
        let actor = ActorId::new(Uuid::new_v4());
        h.inventory.grant_units(actor, 1);

        let err = h
            .creator
            .create_for_actor("http://x/img.png", 1, 1, "a", actor, false)
            .await
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "build_failed");
        assert_eq!(h.inventory.units(actor), 1);
        assert!(h.creator.tasks().recent().is_empty());
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_after_probe() {
        let h = harness(
            StubProber {
                size: Some(4096),
                content_type: Some("image/png"),
                ..Default::default()
            },
            Behaviour::Succeed,
            None,
        );
        let actor = ActorId::new(Uuid::new_v4());
        h.inventory.grant_units(actor, 1);

        let err = h
            .creator
            .create_for_actor("http://x/huge.png", 1, 1, "huge", actor, false)
            .await
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CreationError::Pipeline(PipelineError::FileTooLarge { .. })
        ));
        assert_eq!(h.inventory.units(actor), 1);
        assert_eq!(h.static_builder.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upload_disabled_fails_without_probing() {
        let h = harness(png_prober(), Behaviour::Succeed, None);
        let actor = ActorId::new(Uuid::new_v4());
        h.inventory.grant_units(actor, 1);

        let err = h
            .creator
            .create_for_actor("upload", 1, 1, "up", actor, false)
            .await
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CreationError::Pipeline(PipelineError::UploadsDisabled)
        ));
        assert_eq!(err.kind(), "build_failed");
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.inventory.units(actor), 1);
    }

    #[tokio::test]
    async fn upload_that_never_arrives_fails_and_refunds() {
        let h = harness(png_prober(), Behaviour::Succeed, Some(Arc::new(NeverUploads)));
        let actor = ActorId::new(Uuid::new_v4());
        h.inventory.grant_units(actor, 2);

        let err = h
            .creator
            .create_for_actor("UPLOAD", 2, 1, "late", actor, false)
            .await
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CreationError::Pipeline(PipelineError::UploadFailed(UploadError::TimedOut(_)))
        ));
        assert_eq!(h.inventory.units(actor), 2);
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn insufficient_units_rejects_before_background_work() {
        let h = harness(png_prober(), Behaviour::Succeed, None);
        let actor = ActorId::new(Uuid::new_v4());
        h.inventory.grant_units(actor, 3);

        let err = h
            .creator
            .create_for_actor("http://x/img.png", 2, 2, "a", actor, false)
            .await
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CreationError::Validation(ValidationError::InsufficientUnits { .. })
        ));
        assert_eq!(h.inventory.units(actor), 3);
        assert_eq!(h.prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_without_actor_is_registered_but_not_delivered() {
        let h = harness(png_prober(), Behaviour::Succeed, None);
        let owner = OwnerId::new(Uuid::new_v4());

        let map = h
            .creator
            .create(CreationRequest::new("http://x/img.png", 3, 1, "banner", owner))
            .await
            .expect("created");

        assert_eq!(map.dimensions, Dimensions::new(3, 1));
        assert_eq!(map.tiles.len(), 3);
        assert_eq!(h.registry.count_by_owner(owner).await.unwrap(), 1);
    }
}
