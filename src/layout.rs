//! Where builds put things, and how they run external tools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process;

/// Directory name of the build-state store inside the images directory.
pub const STATE_SUBDIR: &str = ".build_states";

/// Per-mirror bootstrap timeout (30 minutes).
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Filesystem layout of the builder.
///
/// ```text
/// <images_dir>/
///     <name>-<distro>-<version>.tar.zst   produced artifacts
///     .build_states/<build_id>.json       resumable records
///     .build_states/locks/<build_id>.lock
/// <work_root>/build_<build_id>_<n>/rootfs working trees
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderLayout {
    pub images_dir: PathBuf,
    pub state_dir: PathBuf,
    pub work_root: PathBuf,
}

impl BuilderLayout {
    /// Layout rooted at `images_dir`, with work trees under the system temp dir.
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        let images_dir = images_dir.into();
        Self {
            state_dir: images_dir.join(STATE_SUBDIR),
            images_dir,
            work_root: std::env::temp_dir(),
        }
    }

    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = work_root.into();
        self
    }

    /// `~/.local/share/rootfs-builder/images` (or `/tmp` when no data dir).
    pub fn default_images_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("rootfs-builder")
            .join("images")
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }
}

impl Default for BuilderLayout {
    fn default() -> Self {
        Self::new(Self::default_images_dir())
    }
}

/// How privileged commands are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privilege {
    /// `sudo` unless already running as root.
    #[default]
    Auto,
    /// Always go through `sudo`.
    Sudo,
    /// Never use `sudo`; commands run with the caller's privileges.
    Direct,
}

impl Privilege {
    pub fn use_sudo(self) -> bool {
        match self {
            Privilege::Auto => !process::running_as_root(),
            Privilege::Sudo => true,
            Privilege::Direct => false,
        }
    }
}

/// How the rootfs is turned into an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveBackend {
    /// In-process when running as root, host `tar` through sudo otherwise.
    #[default]
    Auto,
    /// `tar` + `zstd` crates in this process. Needs read access to every file.
    InProcess,
    /// Host `tar --zstd`, elevated according to [`Privilege`].
    HostTar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub bootstrap_timeout: Duration,
    pub privilege: Privilege,
    pub archive_backend: ArchiveBackend,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            privilege: Privilege::default(),
            archive_backend: ArchiveBackend::default(),
        }
    }
}
