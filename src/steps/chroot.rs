//! Access to the rootfs being assembled.
//!
//! After a privileged bootstrap the tree belongs to root, so writes go
//! through `sudo install` unless the pipeline runs without elevation.
//! Scripts are dropped into `<rootfs>/tmp` and executed with `chroot`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};

use crate::cancel::CancelToken;
use crate::process::{Cmd, CmdOutput};

static STAGED: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct Rootfs<'a> {
    path: &'a Path,
    sudo: bool,
    cancel: &'a CancelToken,
}

impl<'a> Rootfs<'a> {
    pub(crate) fn new(path: &'a Path, sudo: bool, cancel: &'a CancelToken) -> Self {
        Self { path, sudo, cancel }
    }

    /// Host path of `inner`, an absolute path inside the rootfs.
    pub(crate) fn resolve(&self, inner: &str) -> PathBuf {
        self.path.join(inner.trim_start_matches('/'))
    }

    fn cmd(&self, program: &str) -> Cmd {
        Cmd::new(program).sudo(self.sudo).cancel(self.cancel)
    }

    pub(crate) fn read_optional(&self, inner: &str) -> Result<Option<String>> {
        let path = self.resolve(inner);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Write `contents` to `inner` with `mode`, creating parent directories.
    pub(crate) fn write_file(&self, inner: &str, contents: &str, mode: u32) -> Result<()> {
        let dst = self.resolve(inner);

        if !self.sudo {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::write(&dst, contents).with_context(|| format!("writing {}", dst.display()))?;
            fs::set_permissions(&dst, fs::Permissions::from_mode(mode))
                .with_context(|| format!("setting mode of {}", dst.display()))?;
            return Ok(());
        }

        let staged = std::env::temp_dir().join(format!(
            "rootfs-builder-{}-{}",
            std::process::id(),
            STAGED.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&staged, contents)
            .with_context(|| format!("staging {}", staged.display()))?;
        let installed = self
            .cmd("install")
            .arg("-D")
            .arg(format!("-m{mode:o}"))
            .arg_path(&staged)
            .arg_path(&dst)
            .run();
        if let Err(err) = fs::remove_file(&staged) {
            tracing::debug!(path = %staged.display(), error = %err, "staged file not removed");
        }
        installed.with_context(|| format!("installing {}", dst.display()))?;
        Ok(())
    }

    pub(crate) fn create_dir_all(&self, inner: &str) -> Result<()> {
        let dir = self.resolve(inner);
        if self.sudo {
            self.cmd("mkdir")
                .arg("-p")
                .arg_path(&dir)
                .run()
                .with_context(|| format!("creating {}", dir.display()))?;
        } else {
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    fn remove_file(&self, inner: &str) -> Result<()> {
        let path = self.resolve(inner);
        if self.sudo {
            self.cmd("rm").arg("-f").arg_path(&path).run()?;
        } else if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err).with_context(|| format!("removing {}", path.display()));
            }
        }
        Ok(())
    }

    /// Run `script` as `/tmp/<name>.sh` inside the rootfs.
    ///
    /// The script is removed afterwards whether or not it succeeded.
    pub(crate) fn run_script(&self, name: &str, script: &str) -> Result<CmdOutput> {
        let inner = format!("/tmp/{name}.sh");
        self.write_file(&inner, script, 0o755)?;

        let result = self
            .cmd("chroot")
            .arg_path(self.path)
            .arg(&inner)
            .run()
            .with_context(|| format!("{name} failed inside {}", self.path.display()));

        if let Err(err) = self.remove_file(&inner) {
            tracing::warn!(script = %inner, error = %format!("{err:#}"), "failed to remove script from rootfs");
        }
        result
    }
}
