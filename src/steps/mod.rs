//! The five build steps.
//!
//! [`StepOperations`] is the seam between the state machine in
//! [`crate::pipeline`] and the host: [`HostOperations`] drives debootstrap,
//! chroot and tar, while tests substitute recording mocks.

mod bootstrap;
mod chroot;
mod environment;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::artifact::{ArtifactPackager, PackagedArtifact};
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::events::{BuildEvent, EventSink};
use crate::layout::PipelineSettings;
use crate::preflight;
use crate::process;

pub use bootstrap::debootstrap_command;
pub use environment::merge_environment;

use chroot::Rootfs;

/// What a step needs besides the configuration and the rootfs path.
pub struct StepContext<'a> {
    pub build_id: &'a str,
    pub events: &'a dyn EventSink,
    pub cancel: &'a CancelToken,
}

/// Host side of each build step.
///
/// Every operation receives the rootfs path recorded for the build, which is
/// the same path across resumes.
pub trait StepOperations {
    /// Checked before any build record exists. Errors are not resumable.
    fn preflight(&self, events: &dyn EventSink) -> Result<()>;

    fn bootstrap(&self, ctx: &StepContext<'_>, config: &BuildConfig, rootfs: &Path) -> Result<()>;

    fn install_packages(
        &self,
        ctx: &StepContext<'_>,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<()>;

    fn run_custom_commands(
        &self,
        ctx: &StepContext<'_>,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<()>;

    fn setup_environment(
        &self,
        ctx: &StepContext<'_>,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<()>;

    /// Archive the rootfs. Must not touch build state or the work dir.
    fn package_artifact(
        &self,
        ctx: &StepContext<'_>,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<PackagedArtifact>;

    /// Remove a build's working directory after success or on discard.
    fn remove_work_dir(&self, work_dir: &Path) -> Result<()> {
        if work_dir.exists() {
            fs::remove_dir_all(work_dir)
                .with_context(|| format!("removing {}", work_dir.display()))?;
        }
        Ok(())
    }
}

/// Real step implementations.
#[derive(Debug, Clone)]
pub struct HostOperations {
    images_dir: PathBuf,
    settings: PipelineSettings,
}

impl HostOperations {
    pub fn new(images_dir: impl Into<PathBuf>, settings: PipelineSettings) -> Self {
        Self {
            images_dir: images_dir.into(),
            settings,
        }
    }

    fn rootfs<'a>(&self, ctx: &StepContext<'a>, rootfs: &'a Path) -> Rootfs<'a> {
        Rootfs::new(rootfs, self.settings.privilege.use_sudo(), ctx.cancel)
    }
}

impl StepOperations for HostOperations {
    fn preflight(&self, events: &dyn EventSink) -> Result<()> {
        preflight::check_host_tools()?;
        if !process::running_as_root() && self.settings.privilege.use_sudo() {
            events.emit(BuildEvent::Warning {
                message: "not running as root; privileged commands will use sudo".to_string(),
            });
        }
        Ok(())
    }

    fn bootstrap(&self, ctx: &StepContext<'_>, config: &BuildConfig, rootfs: &Path) -> Result<()> {
        bootstrap::run(
            ctx,
            config,
            rootfs,
            self.settings.bootstrap_timeout,
            self.settings.privilege.use_sudo(),
        )
    }

    fn install_packages(
        &self,
        ctx: &StepContext<'_>,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<()> {
        let distro = config.distro();
        let script = distro.package_script(&config.packages);
        let output = self
            .rootfs(ctx, rootfs)
            .run_script("install_packages", &script)
            .with_context(|| format!("installing packages: {}", config.packages.join(", ")))?;

        if !distro.is_supported() {
            ctx.events.emit(BuildEvent::Warning {
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn run_custom_commands(
        &self,
        ctx: &StepContext<'_>,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<()> {
        let script = custom_commands_script(&config.custom_commands);
        self.rootfs(ctx, rootfs)
            .run_script("custom_commands", &script)
            .context("custom commands failed")?;
        Ok(())
    }

    fn setup_environment(
        &self,
        ctx: &StepContext<'_>,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<()> {
        environment::run(ctx, config, &self.rootfs(ctx, rootfs))
    }

    fn package_artifact(
        &self,
        ctx: &StepContext<'_>,
        config: &BuildConfig,
        rootfs: &Path,
    ) -> Result<PackagedArtifact> {
        let artifact = ArtifactPackager::new(&self.images_dir, &self.settings)
            .with_cancel(ctx.cancel)
            .package(config, rootfs)?;
        tracing::info!(
            build_id = ctx.build_id,
            path = %artifact.path.display(),
            size_bytes = artifact.size_bytes,
            sha256 = %artifact.sha256,
            "image archived"
        );
        Ok(artifact)
    }

    fn remove_work_dir(&self, work_dir: &Path) -> Result<()> {
        if !work_dir.exists() {
            return Ok(());
        }
        if self.settings.privilege.use_sudo() {
            process::Cmd::new("rm")
                .args(["-rf", "--one-file-system"])
                .arg_path(work_dir)
                .sudo(true)
                .run()
                .with_context(|| format!("removing {}", work_dir.display()))?;
            return Ok(());
        }
        fs::remove_dir_all(work_dir).with_context(|| format!("removing {}", work_dir.display()))
    }
}

/// Configured commands as one script that stops at the first failure.
pub fn custom_commands_script(commands: &[String]) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n\n");
    for command in commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}
