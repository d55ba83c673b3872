//! Resumable root filesystem image builder.
//!
//! Builds a compressed rootfs archive for a Linux distribution from a
//! declarative [`BuildConfig`], as a fixed sequence of steps whose progress
//! is persisted after each one:
//!
//! - **Pipeline** - the step executor; resumes interrupted builds by id
//! - **State** - atomic, versioned build records plus a per-build lock
//! - **Steps** - debootstrap, chroot scripts, environment, archiving
//! - **Mirror selection** - ordered fallback across distribution mirrors
//! - **Preflight checks** - host tool validation before a record exists
//!
//! # Architecture
//!
//! ```text
//! Pipeline::build(config, resume)
//!     │
//!     ├── preflight            (no record on failure)
//!     ├── StateStore           <images>/.build_states/<id>.json
//!     ├── work dir             <work_root>/build_<id>_<n>/rootfs
//!     └── StepOperations
//!             ├── bootstrap        debootstrap via MirrorSelector
//!             ├── packages         chroot /tmp/install_packages.sh
//!             ├── custom_commands  chroot /tmp/custom_commands.sh
//!             ├── environment      user, /etc/environment, working_dir
//!             └── package_artifact <images>/<name>-<distro>-<version>.tar.zst
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use rootfs_builder::{BuildConfig, BuilderLayout, Pipeline, PipelineSettings, TracingSink};
//!
//! let mut config = BuildConfig::new("t1", "debian", "12");
//! config.packages.push("curl".into());
//!
//! let pipeline = Pipeline::host(BuilderLayout::default(), PipelineSettings::default(), &TracingSink)?;
//! match pipeline.build(&config, None) {
//!     Ok(outcome) => println!("{}", outcome.artifact.path.display()),
//!     Err(err) => {
//!         if let Some(id) = err.build_id() {
//!             eprintln!("resume with: {id}");
//!         }
//!     }
//! }
//! ```

pub mod artifact;
pub mod build_id;
pub mod cancel;
pub mod config;
pub mod distro;
pub mod events;
pub mod layout;
pub mod mirror;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod state;
pub mod steps;

pub use artifact::{delete_image, list_images, ArtifactPackager, ImageInfo, PackagedArtifact};
pub use cancel::CancelToken;
pub use config::{BuildConfig, ConfigSource, DirConfigSource};
pub use distro::Distribution;
pub use events::{BuildEvent, EventSink, TracingSink};
pub use layout::{ArchiveBackend, BuilderLayout, PipelineSettings, Privilege};
pub use pipeline::{BuildError, BuildOutcome, FailureKind, Pipeline};
pub use state::{BuildRecord, BuildStep, StateError, StateStore};
pub use steps::{HostOperations, StepContext, StepOperations};
