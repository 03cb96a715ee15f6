//! Container recreate orchestration.
//!
//! Replaces a container with a clone created from the same configuration
//! (and, optionally, a freshly pulled image) while keeping at least one
//! instance on the host at every step:
//!
//! ```text
//! Snapshot → ImageChecked → Cloned → OldStopped → NewStarted → OldRemoved → Renamed → Done
//!                                        │             │
//!                                        └─────────────┴──→ RolledBack | FailedIrrecoverable
//! ```
//!
//! When a step before `OldRemoved` fails, the compensating actions listed by
//! [`compensations_for`] run on their own grace timeout, even when the
//! caller's deadline has already elapsed. Failures of `OldRemoved` and
//! `Renamed` leave the clone running and are reported as cleanup failures of
//! an otherwise successful outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use refit_core::config::RecreateConfig;
use refit_core::error::{Compensation, RecreateFailure, RefitError, Result};
use refit_core::event::events::{
    CONTAINER_CREATE, CONTAINER_REMOVE, CONTAINER_RENAME, CONTAINER_START, CONTAINER_STOP,
    IMAGE_CHECK, IMAGE_PULL, PROP_COMPENSATION, PROP_CONTAINER_ID, PROP_CONTAINER_NAME,
    PROP_IMAGE, PROP_MESSAGE,
};
use refit_core::event::{EventContext, EventPublisher, EventStage, Properties, Transition};
use tokio::time::Instant;

use crate::engine::{ContainerEngine, ContainerSnapshot};
use crate::registry::{CredentialProvider, ImageReference};
use crate::staleness::StalenessResolver;

/// States of a recreate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreatePhase {
    Snapshot,
    ImageChecked,
    Cloned,
    OldStopped,
    NewStarted,
    OldRemoved,
    Renamed,
    Done,
    RolledBack,
    FailedIrrecoverable,
}

impl std::fmt::Display for RecreatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecreatePhase::Snapshot => "snapshot",
            RecreatePhase::ImageChecked => "image-check",
            RecreatePhase::Cloned => "create",
            RecreatePhase::OldStopped => "stop",
            RecreatePhase::NewStarted => "start",
            RecreatePhase::OldRemoved => "remove",
            RecreatePhase::Renamed => "rename",
            RecreatePhase::Done => "done",
            RecreatePhase::RolledBack => "rolled-back",
            RecreatePhase::FailedIrrecoverable => "failed-irrecoverable",
        };
        write!(f, "{}", name)
    }
}

/// Action undoing part of a failed recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensatingAction {
    /// Start the original container again
    RestartOriginal,
    /// Remove the clone (by ID, or by its temporary name if creation was cut off)
    RemoveClone,
}

impl CompensatingAction {
    fn label(&self) -> &'static str {
        match self {
            CompensatingAction::RestartOriginal => "restart original",
            CompensatingAction::RemoveClone => "remove clone",
        }
    }
}

/// Compensating actions for a failure while entering `failed`, in run order.
///
/// A timed-out call may still have taken effect on the engine, so timeouts
/// also undo the step that was in flight.
pub fn compensations_for(
    failed: RecreatePhase,
    original_running: bool,
    cause: &RefitError,
) -> Vec<CompensatingAction> {
    let timed_out = matches!(cause, RefitError::Timeout(_));
    match failed {
        RecreatePhase::Cloned if timed_out => vec![CompensatingAction::RemoveClone],
        RecreatePhase::OldStopped if original_running && timed_out => vec![
            CompensatingAction::RestartOriginal,
            CompensatingAction::RemoveClone,
        ],
        RecreatePhase::OldStopped => vec![CompensatingAction::RemoveClone],
        RecreatePhase::NewStarted if original_running => vec![
            CompensatingAction::RestartOriginal,
            CompensatingAction::RemoveClone,
        ],
        RecreatePhase::NewStarted => vec![CompensatingAction::RemoveClone],
        _ => Vec::new(),
    }
}

/// Parameters of one recreate call.
#[derive(Debug, Clone)]
pub struct RecreateRequest {
    pub container_id: String,
    /// Check the registry and pull a newer image before cloning
    pub pull_check: bool,
    /// Skip the staleness gate; the clone/swap always happens
    pub force: bool,
    /// Overall deadline; falls back to the configured one
    pub deadline: Option<Duration>,
}

impl RecreateRequest {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            pull_check: false,
            force: false,
            deadline: None,
        }
    }

    pub fn pull_check(mut self, pull_check: bool) -> Self {
        self.pull_check = pull_check;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A post-start step that failed while the clone stayed live.
#[derive(Debug)]
pub struct CleanupFailure {
    pub phase: RecreatePhase,
    /// Container the step targeted
    pub container_id: String,
    pub error: RefitError,
}

impl std::fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.phase, self.container_id, self.error)
    }
}

/// Result of a recreate that left a working container.
#[derive(Debug)]
pub struct RecreateOutcome {
    /// The live container: the clone when updated, else the original
    pub container_id: String,
    pub previous_id: String,
    pub updated: bool,
    /// Registry digest seen by the staleness check, when one ran
    pub remote_digest: Option<String>,
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl RecreateOutcome {
    /// False when the clone is live but the original or its name lingers.
    pub fn is_complete(&self) -> bool {
        self.cleanup_failures.is_empty()
    }
}

/// Drives recreate operations against a container engine.
pub struct RecreateOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    resolver: Arc<StalenessResolver>,
    credentials: Arc<dyn CredentialProvider>,
    events: EventPublisher,
    compensation_grace: Duration,
    default_deadline: Option<Duration>,
}

impl RecreateOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        resolver: Arc<StalenessResolver>,
        credentials: Arc<dyn CredentialProvider>,
        events: EventPublisher,
        config: &RecreateConfig,
    ) -> Self {
        Self {
            engine,
            resolver,
            credentials,
            events,
            compensation_grace: config.compensation_grace(),
            default_deadline: config.deadline(),
        }
    }

    /// Recreate `request.container_id`.
    ///
    /// Callers must not run two recreates of the same container at once.
    pub async fn recreate(&self, request: RecreateRequest) -> Result<RecreateOutcome> {
        let deadline = request
            .deadline
            .or(self.default_deadline)
            .map(|d| Instant::now() + d);

        let snapshot = within(
            deadline,
            "inspect",
            &request.container_id,
            self.engine.inspect(&request.container_id),
        )
        .await?;

        tracing::info!(
            container_id = %snapshot.id,
            name = %snapshot.name,
            image = %snapshot.image,
            running = snapshot.running,
            pull_check = request.pull_check,
            force = request.force,
            "Recreating container"
        );

        let context = EventContext::new()
            .with(PROP_CONTAINER_ID, &snapshot.id)
            .with(PROP_CONTAINER_NAME, &snapshot.name)
            .with(PROP_IMAGE, &snapshot.image);

        let operation = RecreateOperation {
            orchestrator: self,
            events: self.events.with_context(&context),
            temp_name: temporary_name(&snapshot.name),
            snapshot,
            clone_id: None,
            phase: RecreatePhase::Snapshot,
            deadline,
        };
        operation.run(request.pull_check, request.force).await
    }
}

/// `<name>-refit-<8 hex>`, unique per operation.
pub fn temporary_name(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-refit-{}", name, &suffix[..8])
}

/// Run `fut` under an optional deadline.
async fn within<T>(
    deadline: Option<Instant>,
    operation: &str,
    target: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .unwrap_or_else(|_| {
                Err(RefitError::Timeout(format!(
                    "deadline elapsed during {} {}",
                    operation, target
                )))
            }),
        None => fut.await,
    }
}

enum ImageCheck {
    /// Local image matches the registry; nothing to do
    Current(String),
    /// A newer image (or a forced pull) was fetched
    Pulled(Option<String>),
}

/// One in-flight recreate. Never persisted.
struct RecreateOperation<'a> {
    orchestrator: &'a RecreateOrchestrator,
    events: EventPublisher,
    snapshot: ContainerSnapshot,
    temp_name: String,
    clone_id: Option<String>,
    phase: RecreatePhase,
    deadline: Option<Instant>,
}

impl<'a> RecreateOperation<'a> {
    fn engine(&self) -> &dyn ContainerEngine {
        self.orchestrator.engine.as_ref()
    }

    fn advance(&mut self, phase: RecreatePhase) {
        tracing::debug!(
            container_id = %self.snapshot.id,
            from = %self.phase,
            to = %phase,
            "Recreate phase"
        );
        self.phase = phase;
    }

    async fn run(mut self, pull_check: bool, force: bool) -> Result<RecreateOutcome> {
        let mut remote_digest = None;
        if pull_check {
            match self.check_image(force).await {
                Ok(ImageCheck::Current(digest)) => {
                    self.advance(RecreatePhase::Done);
                    tracing::info!(
                        container_id = %self.snapshot.id,
                        digest = %digest,
                        "Image is current, container left unchanged"
                    );
                    return Ok(RecreateOutcome {
                        container_id: self.snapshot.id.clone(),
                        previous_id: self.snapshot.id.clone(),
                        updated: false,
                        remote_digest: Some(digest),
                        cleanup_failures: Vec::new(),
                    });
                }
                Ok(ImageCheck::Pulled(digest)) => remote_digest = digest,
                Err(e) => return Err(self.fail(RecreatePhase::ImageChecked, e).await),
            }
        }
        self.advance(RecreatePhase::ImageChecked);

        // Cloned
        let spec = self.snapshot.spec.clone();
        let temp_name = self.temp_name.clone();
        let created = self
            .forward(
                CONTAINER_CREATE,
                props(&[(PROP_CONTAINER_NAME, temp_name.as_str())]),
                "create",
                &temp_name,
                self.engine().create(&temp_name, &spec),
            )
            .await;
        let clone_id = match created {
            Ok(id) => id,
            Err(e) => return Err(self.fail(RecreatePhase::Cloned, e).await),
        };
        self.clone_id = Some(clone_id.clone());
        self.advance(RecreatePhase::Cloned);

        // OldStopped
        if self.snapshot.running {
            let original = self.snapshot.id.clone();
            let stopped = self
                .forward(
                    CONTAINER_STOP,
                    Properties::new(),
                    "stop",
                    &original,
                    self.engine().stop(&original),
                )
                .await;
            if let Err(e) = stopped {
                return Err(self.fail(RecreatePhase::OldStopped, e).await);
            }
        }
        self.advance(RecreatePhase::OldStopped);

        // NewStarted
        let started = self
            .forward(
                CONTAINER_START,
                props(&[
                    (PROP_CONTAINER_ID, clone_id.as_str()),
                    (PROP_CONTAINER_NAME, temp_name.as_str()),
                ]),
                "start",
                &clone_id,
                self.engine().start(&clone_id),
            )
            .await;
        if let Err(e) = started {
            return Err(self.fail(RecreatePhase::NewStarted, e).await);
        }
        self.advance(RecreatePhase::NewStarted);

        // From here on the clone is live and is never undone
        let mut cleanup_failures = Vec::new();

        let original = self.snapshot.id.clone();
        let removed = self
            .forward(
                CONTAINER_REMOVE,
                Properties::new(),
                "remove",
                &original,
                self.engine().remove(&original),
            )
            .await;
        match removed {
            Ok(()) => self.advance(RecreatePhase::OldRemoved),
            Err(error) => {
                tracing::warn!(
                    container_id = %original,
                    error = %error,
                    "Original container could not be removed, clone stays live"
                );
                cleanup_failures.push(CleanupFailure {
                    phase: RecreatePhase::OldRemoved,
                    container_id: original.clone(),
                    error,
                });
            }
        }

        let name = self.snapshot.name.clone();
        if self.phase == RecreatePhase::OldRemoved {
            let renamed = self
                .forward(
                    CONTAINER_RENAME,
                    props(&[
                        (PROP_CONTAINER_ID, clone_id.as_str()),
                        (PROP_CONTAINER_NAME, name.as_str()),
                    ]),
                    "rename",
                    &clone_id,
                    self.engine().rename(&clone_id, &name),
                )
                .await;
            match renamed {
                Ok(()) => self.advance(RecreatePhase::Renamed),
                Err(error) => {
                    tracing::warn!(
                        container_id = %clone_id,
                        temp_name = %temp_name,
                        error = %error,
                        "Clone could not be renamed, it stays live under its temporary name"
                    );
                    cleanup_failures.push(CleanupFailure {
                        phase: RecreatePhase::Renamed,
                        container_id: clone_id.clone(),
                        error,
                    });
                }
            }
        } else {
            cleanup_failures.push(CleanupFailure {
                phase: RecreatePhase::Renamed,
                container_id: clone_id.clone(),
                error: RefitError::Other(format!(
                    "rename to {} skipped: original container still holds the name",
                    name
                )),
            });
        }

        self.advance(RecreatePhase::Done);
        tracing::info!(
            previous_id = %self.snapshot.id,
            container_id = %clone_id,
            complete = cleanup_failures.is_empty(),
            "Container recreated"
        );

        Ok(RecreateOutcome {
            container_id: clone_id,
            previous_id: self.snapshot.id.clone(),
            updated: true,
            remote_digest,
            cleanup_failures,
        })
    }

    /// Staleness gate and pull. `force` skips the gate but still pulls.
    async fn check_image(&self, force: bool) -> Result<ImageCheck> {
        let image = self.snapshot.image.clone();
        let reference = ImageReference::parse(&image)?;
        let mut remote_digest = None;

        if !force {
            let staleness = self
                .forward(
                    IMAGE_CHECK,
                    Properties::new(),
                    "image check",
                    &image,
                    async {
                        let local_digests: Vec<String> = self
                            .engine()
                            .list_images(&reference.local_name())
                            .await?
                            .into_iter()
                            .flat_map(|record| record.repo_digests)
                            .collect();
                        self.orchestrator
                            .resolver
                            .is_stale(&reference, &local_digests)
                            .await
                    },
                )
                .await?;

            if !staleness.stale {
                return Ok(ImageCheck::Current(staleness.remote_digest));
            }
            remote_digest = Some(staleness.remote_digest);
        }

        let credential = self.orchestrator.credentials.resolve(&reference.registry);
        self.forward(
            IMAGE_PULL,
            Properties::new(),
            "pull",
            &image,
            self.engine().pull(&reference, &credential),
        )
        .await?;

        Ok(ImageCheck::Pulled(remote_digest))
    }

    /// Forward step: begin event, the call under the deadline, then end or error event.
    async fn forward<T>(
        &self,
        transition: Transition,
        properties: Properties,
        operation: &str,
        target: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.events
            .emit(transition, EventStage::Begin, properties.clone());
        let result = within(self.deadline, operation, target, fut).await;
        self.finish(transition, properties, &result);
        result
    }

    /// Compensating step: like `forward`, but bounded by the grace timeout
    /// instead of the deadline.
    async fn compensate(
        &self,
        transition: Transition,
        action: CompensatingAction,
        container_id: &str,
        fut: impl Future<Output = Result<()>>,
    ) -> Compensation {
        let properties = props(&[
            (PROP_CONTAINER_ID, container_id),
            (PROP_COMPENSATION, "true"),
        ]);
        self.events
            .emit(transition, EventStage::Begin, properties.clone());

        let grace = self.orchestrator.compensation_grace;
        let result = match tokio::time::timeout(grace, fut).await {
            Ok(result) => result,
            Err(_) => Err(RefitError::Timeout(format!(
                "{} {} did not finish within {}s grace",
                action.label(),
                container_id,
                grace.as_secs()
            ))),
        };
        self.finish(transition, properties, &result);

        Compensation {
            action: action.label().to_string(),
            container_id: container_id.to_string(),
            error: result.err().map(|e| e.to_string()),
        }
    }

    fn finish<T>(&self, transition: Transition, mut properties: Properties, result: &Result<T>) {
        match result {
            Ok(_) => self.events.emit(transition, EventStage::End, properties),
            Err(e) => {
                properties.insert(PROP_MESSAGE.to_string(), e.to_string());
                self.events.emit(transition, EventStage::Error, properties);
            }
        }
    }

    async fn run_compensation(&self, action: CompensatingAction) -> Compensation {
        match action {
            CompensatingAction::RestartOriginal => {
                let original = self.snapshot.id.as_str();
                self.compensate(
                    CONTAINER_START,
                    action,
                    original,
                    self.engine().start(original),
                )
                .await
            }
            CompensatingAction::RemoveClone => {
                // Without an ID the create call was cut off; the temporary name
                // finds a clone the engine may still have made
                let target = self.clone_id.as_deref().unwrap_or(&self.temp_name);
                let by_name = self.clone_id.is_none();
                self.compensate(CONTAINER_REMOVE, action, target, async move {
                    match self.engine().remove(target).await {
                        Err(RefitError::ContainerNotFound(_)) if by_name => Ok(()),
                        other => other,
                    }
                })
                .await
            }
        }
    }

    /// Run the compensation table for a failure entering `failed` and build
    /// the error reported to the caller.
    async fn fail(&mut self, failed: RecreatePhase, cause: RefitError) -> RefitError {
        tracing::warn!(
            container_id = %self.snapshot.id,
            phase = %failed,
            error = %cause,
            "Recreate step failed"
        );

        let mut compensations = Vec::new();
        let mut original_restored = true;
        for action in compensations_for(failed, self.snapshot.running, &cause) {
            let outcome = self.run_compensation(action).await;
            if action == CompensatingAction::RestartOriginal && !outcome.succeeded() {
                original_restored = false;
            }
            compensations.push(outcome);
        }

        let failure = Box::new(RecreateFailure {
            container_id: self.snapshot.id.clone(),
            phase: failed.to_string(),
            cause: Box::new(cause),
            compensations,
        });

        if original_restored {
            self.advance(RecreatePhase::RolledBack);
            let error = RefitError::RecreateFailed(failure);
            tracing::warn!(container_id = %self.snapshot.id, phase = %self.phase, "{}", error);
            error
        } else {
            self.advance(RecreatePhase::FailedIrrecoverable);
            let error = RefitError::Irrecoverable(failure);
            tracing::error!(
                container_id = %self.snapshot.id,
                clone_id = ?self.clone_id,
                "{}",
                error
            );
            error
        }
    }
}

fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
