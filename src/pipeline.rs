//! Step executor.
//!
//! Drives one build record through the fixed step sequence:
//!
//! ```text
//! bootstrap -> packages -> custom_commands -> environment -> package_artifact
//! ```
//!
//! Progress is persisted after every step, and a failure is persisted before
//! it is returned, so the build id handed back in [`BuildError`] is always a
//! valid resumption token. Resuming reuses the working directory recorded for
//! the build and starts at the first step after the highest completed one.
//!
//! On success the state record and the working directory are removed and only
//! the archive remains. On failure the working directory is kept.

use std::fmt;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::artifact::{self, PackagedArtifact};
use crate::build_id::generate_build_id;
use crate::cancel::CancelToken;
use crate::config::{BuildConfig, ConfigSource};
use crate::events::{BuildEvent, EventSink};
use crate::layout::{BuilderLayout, PipelineSettings};
use crate::mirror::MirrorError;
use crate::process::CommandError;
use crate::state::{BuildLock, BuildRecord, BuildStep, StateError, StateStore};
use crate::steps::{HostOperations, StepContext, StepOperations};

const ID_ATTEMPTS: usize = 32;

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "must be run as root",
    "a password is required",
    "not in the sudoers",
];

/// Why a step failed, for deciding what to tell the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Permission,
    Network,
    ExternalTool,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn classify(err: &anyhow::Error) -> Self {
        let mut mirror = false;
        let mut command = false;
        for cause in err.chain() {
            if let Some(err) = cause.downcast_ref::<CommandError>() {
                if matches!(err, CommandError::Cancelled { .. }) {
                    return Self::Cancelled;
                }
                command = true;
            }
            if let Some(err) = cause.downcast_ref::<MirrorError>() {
                if matches!(err, MirrorError::Cancelled { .. }) {
                    return Self::Cancelled;
                }
                mirror = true;
            }
            if let Some(err) = cause.downcast_ref::<io::Error>() {
                if err.kind() == io::ErrorKind::PermissionDenied {
                    return Self::Permission;
                }
            }
        }

        let text = format!("{err:#}").to_ascii_lowercase();
        if PERMISSION_MARKERS.iter().any(|m| text.contains(m)) {
            Self::Permission
        } else if mirror {
            Self::Network
        } else if command {
            Self::ExternalTool
        } else {
            Self::Internal
        }
    }

    pub fn hint(self) -> Option<&'static str> {
        match self {
            Self::Permission => Some(
                "retry with sudo or make the work directory writable and exec-capable",
            ),
            Self::Network => Some("check network access to the distribution mirrors"),
            _ => None,
        }
    }

    fn hint_suffix(&self) -> String {
        self.hint()
            .map(|hint| format!(" (hint: {hint})"))
            .unwrap_or_default()
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Permission => "permission",
            Self::Network => "network",
            Self::ExternalTool => "external tool",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        })
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("preflight failed: {0:#}")]
    Precondition(#[source] anyhow::Error),
    #[error("invalid configuration: {0:#}")]
    Config(#[source] anyhow::Error),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("no build with id '{0}'")]
    UnknownBuild(String),
    #[error("build '{build_id}' was started for configuration '{expected}', not '{found}'")]
    ConfigMismatch {
        build_id: String,
        expected: String,
        found: String,
    },
    #[error("build {build_id}: recording progress failed: {source}; resume with build id {build_id}")]
    Persist {
        build_id: String,
        #[source]
        source: StateError,
    },
    #[error("build {build_id}: preparing working directory: {source}")]
    Workspace {
        build_id: String,
        #[source]
        source: io::Error,
    },
    #[error(
        "build {build_id} failed at step {step}: {source:#}{}; resume with build id {build_id}",
        .kind.hint_suffix()
    )]
    Step {
        build_id: String,
        step: BuildStep,
        kind: FailureKind,
        #[source]
        source: anyhow::Error,
    },
    #[error("build {build_id} cancelled; resume with build id {build_id}")]
    Cancelled { build_id: String },
    #[error("build {build_id} could not be finalized: {source:#}")]
    Finalize {
        build_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BuildError {
    /// Resumption token, for every failure raised after a record exists.
    pub fn build_id(&self) -> Option<&str> {
        match self {
            Self::ConfigMismatch { build_id, .. }
            | Self::Persist { build_id, .. }
            | Self::Workspace { build_id, .. }
            | Self::Step { build_id, .. }
            | Self::Cancelled { build_id }
            | Self::Finalize { build_id, .. } => Some(build_id),
            _ => None,
        }
    }
}

/// A finished build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub build_id: String,
    pub artifact: PackagedArtifact,
    pub resumed: bool,
}

pub struct Pipeline<'a, O: StepOperations> {
    layout: BuilderLayout,
    store: StateStore,
    ops: O,
    events: &'a dyn EventSink,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a, HostOperations> {
    /// Pipeline driving the real host tools.
    pub fn host(
        layout: BuilderLayout,
        settings: PipelineSettings,
        events: &'a dyn EventSink,
    ) -> Result<Self, BuildError> {
        let ops = HostOperations::new(layout.images_dir.clone(), settings);
        Self::new(layout, ops, events)
    }
}

impl<'a, O: StepOperations> Pipeline<'a, O> {
    pub fn new(layout: BuilderLayout, ops: O, events: &'a dyn EventSink) -> Result<Self, BuildError> {
        let store = StateStore::open(&layout.state_dir)?;
        Ok(Self {
            layout,
            store,
            ops,
            events,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn layout(&self) -> &BuilderLayout {
        &self.layout
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Build `config`, or continue the build `resume` if given.
    pub fn build(
        &self,
        config: &BuildConfig,
        resume: Option<&str>,
    ) -> Result<BuildOutcome, BuildError> {
        config.validate().map_err(BuildError::Config)?;
        self.ops
            .preflight(self.events)
            .map_err(BuildError::Precondition)?;

        let (mut record, _lock) = match resume {
            Some(build_id) => self.open_record(build_id, config)?,
            None => self.create_record(config)?,
        };
        let build_id = record.build_id.clone();

        self.events.emit(BuildEvent::Started {
            build_id: build_id.clone(),
            config_name: config.name.clone(),
            resumed: resume.is_some(),
        });

        let artifact = if record.is_finished() {
            None
        } else {
            let rootfs = self.prepare_work_dir(&mut record)?;
            self.run_steps(&mut record, config, &rootfs)?
        };

        let artifact = match artifact {
            Some(artifact) => artifact,
            None => self.existing_artifact(&build_id, config)?,
        };
        self.finish(&record, &artifact)?;

        Ok(BuildOutcome {
            build_id,
            artifact,
            resumed: resume.is_some(),
        })
    }

    /// Continue `build_id`, resolving its configuration through `source`.
    pub fn resume(
        &self,
        build_id: &str,
        source: &dyn ConfigSource,
    ) -> Result<BuildOutcome, BuildError> {
        let record = self.load_known(build_id)?;
        let config = source
            .load(&record.config_name)
            .map_err(BuildError::Config)?;
        self.build(&config, Some(build_id))
    }

    /// Delete a build record and its working directory.
    ///
    /// Returns false if no such build exists. A corrupt record is removed too.
    pub fn discard(&self, build_id: &str) -> Result<bool, BuildError> {
        if !self.store.exists(build_id) {
            return Ok(false);
        }
        let _lock = self.store.lock(build_id)?;
        match self.store.load(build_id) {
            Ok(record) => {
                if let Some(work_dir) = &record.work_dir {
                    self.remove_work_dir(work_dir);
                }
            }
            Err(StateError::NotFound(_)) => return Ok(false),
            Err(err) => self.events.emit(BuildEvent::Warning {
                message: format!("discarding unreadable build state: {err}"),
            }),
        }
        self.store.delete(build_id)?;
        Ok(true)
    }

    /// Discard every build that is not currently running. Returns the count.
    pub fn discard_all(&self) -> Result<usize, BuildError> {
        let mut discarded = 0;
        for listed in self.store.list()? {
            match self.discard(&listed.build_id) {
                Ok(true) => discarded += 1,
                Ok(false) => {}
                Err(BuildError::State(StateError::Locked(id))) => {
                    self.events.emit(BuildEvent::Warning {
                        message: format!("build {id} is running; not discarded"),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(discarded)
    }

    fn load_known(&self, build_id: &str) -> Result<BuildRecord, BuildError> {
        match self.store.load(build_id) {
            Ok(record) => Ok(record),
            Err(StateError::NotFound(_)) => Err(BuildError::UnknownBuild(build_id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    fn open_record(
        &self,
        build_id: &str,
        config: &BuildConfig,
    ) -> Result<(BuildRecord, BuildLock), BuildError> {
        self.load_known(build_id)?;
        let lock = self.store.lock(build_id)?;
        let record = self.load_known(build_id)?;
        if record.config_name != config.name {
            return Err(BuildError::ConfigMismatch {
                build_id: build_id.to_string(),
                expected: record.config_name,
                found: config.name.clone(),
            });
        }
        Ok((record, lock))
    }

    fn create_record(&self, config: &BuildConfig) -> Result<(BuildRecord, BuildLock), BuildError> {
        let mut last = String::new();
        for _ in 0..ID_ATTEMPTS {
            let build_id = generate_build_id().map_err(BuildError::Precondition)?;
            let lock = match self.store.lock(&build_id) {
                Ok(lock) => lock,
                Err(StateError::Locked(_)) => {
                    last = build_id;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match self.store.create(&build_id, &config.name) {
                Ok(record) => return Ok((record, lock)),
                Err(StateError::AlreadyExists(_)) => last = build_id,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StateError::AlreadyExists(last).into())
    }

    /// The rootfs path for `record`, allocating a working directory on first
    /// use and reusing the recorded one afterwards.
    fn prepare_work_dir(&self, record: &mut BuildRecord) -> Result<PathBuf, BuildError> {
        let build_id = record.build_id.clone();
        let workspace = |source: io::Error| BuildError::Workspace {
            build_id: build_id.clone(),
            source,
        };

        if let (Some(work_dir), Some(rootfs)) = (&record.work_dir, &record.rootfs_path) {
            if rootfs.is_dir() {
                self.events.emit(BuildEvent::WorkDir {
                    path: work_dir.clone(),
                    reused: true,
                });
                return Ok(rootfs.clone());
            }
            self.events.emit(BuildEvent::Warning {
                message: format!(
                    "working directory {} is gone; recreating it, earlier progress inside it is lost",
                    work_dir.display()
                ),
            });
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(rootfs)
                .map_err(workspace)?;
            self.events.emit(BuildEvent::WorkDir {
                path: work_dir.clone(),
                reused: false,
            });
            return Ok(rootfs.clone());
        }

        let work_dir = self.allocate_work_dir(&build_id).map_err(workspace)?;
        let rootfs = work_dir.join("rootfs");
        DirBuilder::new()
            .mode(0o755)
            .create(&rootfs)
            .map_err(workspace)?;

        record.work_dir = Some(work_dir.clone());
        record.rootfs_path = Some(rootfs.clone());
        self.store
            .persist(record)
            .map_err(|source| persist_failed(&build_id, source))?;

        self.events.emit(BuildEvent::WorkDir {
            path: work_dir,
            reused: false,
        });
        Ok(rootfs)
    }

    /// `<work_root>/build_<id>_<n>` for the first free `n`.
    fn allocate_work_dir(&self, build_id: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.layout.work_root)?;
        let mut n = 0u32;
        loop {
            let candidate = self.layout.work_root.join(format!("build_{build_id}_{n}"));
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => n += 1,
                Err(err) => return Err(err),
            }
        }
    }

    fn run_steps(
        &self,
        record: &mut BuildRecord,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<Option<PackagedArtifact>, BuildError> {
        let build_id = record.build_id.clone();
        let ctx = StepContext {
            build_id: &build_id,
            events: self.events,
            cancel: &self.cancel,
        };
        let mut artifact = None;

        for step in BuildStep::ALL.into_iter().skip(record.current_step()) {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled {
                    build_id: record.build_id.clone(),
                });
            }

            if record.is_completed(step) {
                self.events.emit(BuildEvent::StepSkipped {
                    step,
                    reason: "already completed".to_string(),
                });
                continue;
            }

            if let Some(reason) = skip_reason(step, config) {
                self.events.emit(BuildEvent::StepSkipped {
                    step,
                    reason: reason.to_string(),
                });
                self.store
                    .mark_step_completed(record, step)
                    .map_err(|source| persist_failed(&build_id, source))?;
                continue;
            }

            self.events.emit(BuildEvent::StepStarted { step });
            let result = match step {
                BuildStep::Bootstrap => self.ops.bootstrap(&ctx, config, rootfs),
                BuildStep::Packages => self.ops.install_packages(&ctx, config, rootfs),
                BuildStep::CustomCommands => self.ops.run_custom_commands(&ctx, config, rootfs),
                BuildStep::Environment => self.ops.setup_environment(&ctx, config, rootfs),
                BuildStep::PackageArtifact => self
                    .ops
                    .package_artifact(&ctx, config, rootfs)
                    .map(|packaged| artifact = Some(packaged)),
            };

            if let Err(source) = result {
                return Err(self.fail_step(record, step, source));
            }

            self.store
                .mark_step_completed(record, step)
                .map_err(|source| persist_failed(&build_id, source))?;
            self.events.emit(BuildEvent::StepCompleted { step });
        }

        Ok(artifact)
    }

    /// Persist the failure, then describe it for the caller.
    fn fail_step(&self, record: &mut BuildRecord, step: BuildStep, source: anyhow::Error) -> BuildError {
        let kind = FailureKind::classify(&source);
        let message = format!("{source:#}");
        self.events.emit(BuildEvent::StepFailed {
            step,
            message: message.clone(),
        });

        if let Err(err) = self.store.mark_step_failed(record, step, message) {
            tracing::error!(
                build_id = %record.build_id,
                %step,
                error = %format!("{source:#}"),
                "step failed and the failure could not be recorded"
            );
            return persist_failed(&record.build_id, err);
        }

        if kind == FailureKind::Cancelled || self.cancel.is_cancelled() {
            return BuildError::Cancelled {
                build_id: record.build_id.clone(),
            };
        }
        BuildError::Step {
            build_id: record.build_id.clone(),
            step,
            kind,
            source,
        }
    }

    /// The archive of a build whose steps all completed in an earlier run.
    fn existing_artifact(
        &self,
        build_id: &str,
        config: &BuildConfig,
    ) -> Result<PackagedArtifact, BuildError> {
        let path = self
            .layout
            .images_dir
            .join(artifact::archive_file_name(config));
        if !path.is_file() {
            return Err(BuildError::Finalize {
                build_id: build_id.to_string(),
                source: anyhow::anyhow!(
                    "every step is complete but {} is missing; discard the build and start over",
                    path.display()
                ),
            });
        }
        artifact::describe_archive(&path).map_err(|source| BuildError::Finalize {
            build_id: build_id.to_string(),
            source,
        })
    }

    fn finish(&self, record: &BuildRecord, artifact: &PackagedArtifact) -> Result<(), BuildError> {
        self.store
            .delete(&record.build_id)
            .map_err(|err| BuildError::Finalize {
                build_id: record.build_id.clone(),
                source: err.into(),
            })?;
        if let Some(work_dir) = &record.work_dir {
            self.remove_work_dir(work_dir);
        }
        self.events.emit(BuildEvent::Finished {
            build_id: record.build_id.clone(),
            artifact: artifact.path.clone(),
        });
        Ok(())
    }

    fn remove_work_dir(&self, work_dir: &Path) {
        if let Err(err) = self.ops.remove_work_dir(work_dir) {
            self.events.emit(BuildEvent::Warning {
                message: format!(
                    "could not remove working directory {}: {err:#}",
                    work_dir.display()
                ),
            });
        }
    }
}

fn persist_failed(build_id: &str, source: StateError) -> BuildError {
    BuildError::Persist {
        build_id: build_id.to_string(),
        source,
    }
}

fn skip_reason(step: BuildStep, config: &BuildConfig) -> Option<&'static str> {
    match step {
        BuildStep::Packages if config.packages.is_empty() => Some("no packages configured"),
        BuildStep::CustomCommands if config.custom_commands.is_empty() => {
            Some("no custom commands configured")
        }
        _ => None,
    }
}
