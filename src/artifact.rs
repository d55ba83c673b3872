//! Artifact packager.
//!
//! Turns a finished rootfs into `<name>-<distribution>-<version>.tar.zst` in
//! the images directory. The archive is written to a hidden `.partial`
//! sibling and renamed into place, so the final name only ever refers to a
//! complete archive.
//!
//! Packaging never touches build state or the working directory; discarding
//! those after a successful archive is the pipeline's job.
//!
//! Two backends:
//! - in-process (`tar` + `zstd` crates), used when we can read every file,
//!   i.e. when running as root;
//! - host `tar --zstd` through `sudo`, for trees created by a privileged
//!   bootstrap that the calling user cannot read.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::layout::{ArchiveBackend, PipelineSettings, Privilege};
use crate::process::{self, Cmd};

pub const ARCHIVE_EXTENSION: &str = "tar.zst";

const ZSTD_LEVEL: i32 = 3;

/// Deterministic archive file name for `config`.
pub fn archive_file_name(config: &BuildConfig) -> String {
    format!(
        "{}-{}-{}.{}",
        config.name,
        config.distro().id(),
        config.version,
        ARCHIVE_EXTENSION
    )
}

/// A finished archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactPackager {
    images_dir: PathBuf,
    backend: ArchiveBackend,
    privilege: Privilege,
    cancel: Option<CancelToken>,
}

impl ArtifactPackager {
    pub fn new(images_dir: impl Into<PathBuf>, settings: &PipelineSettings) -> Self {
        Self {
            images_dir: images_dir.into(),
            backend: settings.archive_backend,
            privilege: settings.privilege,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    pub fn archive_path(&self, config: &BuildConfig) -> PathBuf {
        self.images_dir.join(archive_file_name(config))
    }

    /// Archive `rootfs` and return the published artifact.
    pub fn package(&self, config: &BuildConfig, rootfs: &Path) -> Result<PackagedArtifact> {
        if !rootfs.is_dir() {
            bail!("rootfs directory does not exist: {}", rootfs.display());
        }

        fs::create_dir_all(&self.images_dir).with_context(|| {
            format!(
                "creating images directory '{}'",
                self.images_dir.display()
            )
        })?;

        let file_name = archive_file_name(config);
        let output = self.images_dir.join(&file_name);
        let partial = self
            .images_dir
            .join(format!(".{}.partial-{}", file_name, std::process::id()));

        let written = match self.resolved_backend() {
            ArchiveBackend::HostTar => self.host_tar(rootfs, &partial),
            _ => create_rootfs_tar_zst(rootfs, &partial, self.cancel.as_ref()),
        };
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&partial) {
                tracing::debug!(path = %partial.display(), error = %cleanup, "partial archive not removed");
            }
            return Err(err.context(format!("creating archive '{}'", output.display())));
        }

        fs::rename(&partial, &output).with_context(|| {
            format!(
                "renaming '{}' to '{}'",
                partial.display(),
                output.display()
            )
        })?;

        describe_archive(&output)
    }

    fn resolved_backend(&self) -> ArchiveBackend {
        match self.backend {
            ArchiveBackend::Auto if process::running_as_root() => ArchiveBackend::InProcess,
            ArchiveBackend::Auto => ArchiveBackend::HostTar,
            other => other,
        }
    }

    fn host_tar(&self, rootfs: &Path, output: &Path) -> Result<()> {
        let mut cmd = Cmd::new("tar")
            .arg("--zstd")
            .arg("--numeric-owner")
            .arg("-cf")
            .arg_path(output)
            .arg("-C")
            .arg_path(rootfs)
            .arg(".")
            .sudo(self.privilege.use_sudo());
        if let Some(token) = &self.cancel {
            cmd = cmd.cancel(token);
        }
        cmd.run()?;
        Ok(())
    }
}

/// Write `src_dir` as a zstd-compressed tar, entries sorted by path.
///
/// Ownership, modes and mtimes are preserved since the archive is a root
/// filesystem. Hard links are stored as independent files and sockets are
/// skipped.
pub fn create_rootfs_tar_zst(
    src_dir: &Path,
    out_path: &Path,
    cancel: Option<&CancelToken>,
) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)?;
    let mut builder = TarBuilder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries: Vec<PathBuf> = Vec::new();
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.with_context(|| format!("walking {}", src_dir.display()))?;
        if ent.path() == src_dir {
            continue;
        }
        entries.push(ent.into_path());
    }
    entries.sort();

    for p in entries {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            bail!("archiving cancelled");
        }

        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .into_owned();

        let md = fs::symlink_metadata(&p)
            .with_context(|| format!("reading metadata of {}", p.display()))?;
        let file_type = md.file_type();

        let mut header = tar::Header::new_gnu();
        header.set_mode(md.mode() & 0o7777);
        header.set_uid(u64::from(md.uid()));
        header.set_gid(u64::from(md.gid()));
        header.set_mtime(u64::try_from(md.mtime()).unwrap_or(0));
        header.set_size(0);

        if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            // Targets past the 100-byte header field need a GNU long-link entry.
            builder.append_link(&mut header, &rel, &target)?;
        } else if file_type.is_file() {
            let mut f = File::open(&p).with_context(|| format!("opening {}", p.display()))?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, &rel, &mut f)?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            header.set_entry_type(if file_type.is_char_device() {
                tar::EntryType::Char
            } else {
                tar::EntryType::Block
            });
            let (major, minor) = split_device(md.rdev());
            header.set_device_major(major)?;
            header.set_device_minor(minor)?;
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if file_type.is_fifo() {
            header.set_entry_type(tar::EntryType::Fifo);
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else {
            tracing::debug!(path = %p.display(), "skipping socket");
        }
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

/// Linux `dev_t` encoding, as in glibc's `major()`/`minor()`.
fn split_device(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major as u32, minor as u32)
}

/// Size and digest of an archive already in place.
pub fn describe_archive(path: &Path) -> Result<PackagedArtifact> {
    let (sha256, size_bytes) = sha256_file(path)?;
    Ok(PackagedArtifact {
        path: path.to_path_buf(),
        size_bytes,
        sha256,
    })
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// A built image in the images directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// Built images, newest first. A missing directory has no images.
pub fn list_images(images_dir: &Path) -> Result<Vec<ImageInfo>> {
    if !images_dir.is_dir() {
        return Ok(Vec::new());
    }
    let suffix = format!(".{ARCHIVE_EXTENSION}");
    let mut images = Vec::new();
    for entry in fs::read_dir(images_dir)
        .with_context(|| format!("reading images directory '{}'", images_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating images directory '{}'", images_dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !name.ends_with(&suffix) {
            continue;
        }
        let md = entry.metadata()?;
        if !md.is_file() {
            continue;
        }
        images.push(ImageInfo {
            name,
            path: entry.path(),
            size_bytes: md.len(),
            modified: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    images.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(images)
}

/// Delete `file_name` from the images directory. Returns false if absent.
pub fn delete_image(images_dir: &Path, file_name: &str) -> Result<bool> {
    if file_name.contains('/') || file_name.starts_with('.') {
        bail!("invalid image name '{}'", file_name);
    }
    if !file_name.ends_with(&format!(".{ARCHIVE_EXTENSION}")) {
        bail!(
            "'{}' is not an image archive (expected *.{})",
            file_name,
            ARCHIVE_EXTENSION
        );
    }
    let path = images_dir.join(file_name);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("removing image '{}'", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn in_process() -> PipelineSettings {
        PipelineSettings {
            archive_backend: ArchiveBackend::InProcess,
            ..PipelineSettings::default()
        }
    }

    fn sample_rootfs(root: &Path) -> PathBuf {
        let rootfs = root.join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        fs::write(rootfs.join("etc/hostname"), "builder\n").unwrap();
        fs::write(rootfs.join("usr/bin/tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(rootfs.join("usr/bin/tool"), fs::Permissions::from_mode(0o755))
            .unwrap();
        std::os::unix::fs::symlink("usr/bin", rootfs.join("bin")).unwrap();
        rootfs
    }

    fn read_entries(archive: &Path) -> Vec<(String, tar::EntryType, u32)> {
        let decoder = zstd::stream::Decoder::new(File::open(archive).unwrap()).unwrap();
        let mut ar = tar::Archive::new(decoder);
        ar.entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    e.header().entry_type(),
                    e.header().mode().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_archive_name_is_deterministic() {
        let mut config = BuildConfig::new("t1", "Debian", "12");
        config.packages.push("curl".into());
        assert_eq!(archive_file_name(&config), "t1-debian-12.tar.zst");
    }

    #[test]
    fn test_package_in_process() {
        let tmp = TempDir::new().unwrap();
        let rootfs = sample_rootfs(tmp.path());
        let images = tmp.path().join("images");

        let packager = ArtifactPackager::new(&images, &in_process());
        let config = BuildConfig::new("t1", "debian", "12");
        let artifact = packager.package(&config, &rootfs).unwrap();

        assert_eq!(artifact.path, images.join("t1-debian-12.tar.zst"));
        assert_eq!(artifact.sha256.len(), 64);
        assert_eq!(artifact.size_bytes, fs::metadata(&artifact.path).unwrap().len());

        let entries = read_entries(&artifact.path);
        let names: Vec<_> = entries.iter().map(|(n, _, _)| n.as_str()).collect();
        assert!(names.contains(&"etc/hostname"));
        assert!(names.contains(&"usr/bin/tool"));

        let tool = entries.iter().find(|(n, _, _)| n == "usr/bin/tool").unwrap();
        assert_eq!(tool.2 & 0o777, 0o755);
        let bin = entries.iter().find(|(n, _, _)| n == "bin").unwrap();
        assert_eq!(bin.1, tar::EntryType::Symlink);
    }

    #[test]
    fn test_long_symlink_target_survives() {
        let tmp = TempDir::new().unwrap();
        let rootfs = sample_rootfs(tmp.path());
        let target = format!("/usr/lib/{}/libexample.so.1", "x86_64-linux-gnu-".repeat(10));
        assert!(target.len() > 150);
        std::os::unix::fs::symlink(&target, rootfs.join("usr/bin/long")).unwrap();

        let out = tmp.path().join("out.tar.zst");
        create_rootfs_tar_zst(&rootfs, &out, None).unwrap();

        let decoder = zstd::stream::Decoder::new(File::open(&out).unwrap()).unwrap();
        let mut ar = tar::Archive::new(decoder);
        let link = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().as_ref() == Path::new("usr/bin/long"))
            .unwrap();
        assert_eq!(link.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(
            link.link_name().unwrap().unwrap().as_ref(),
            Path::new(&target)
        );
    }

    #[test]
    fn test_package_leaves_rootfs_alone() {
        let tmp = TempDir::new().unwrap();
        let rootfs = sample_rootfs(tmp.path());
        let packager = ArtifactPackager::new(tmp.path().join("images"), &in_process());
        packager
            .package(&BuildConfig::new("t1", "debian", "12"), &rootfs)
            .unwrap();
        assert!(rootfs.join("etc/hostname").is_file());
    }

    #[test]
    fn test_missing_rootfs_fails_without_partial() {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path().join("images");
        let packager = ArtifactPackager::new(&images, &in_process());
        let err = packager
            .package(&BuildConfig::new("t1", "debian", "12"), &tmp.path().join("nope"))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(list_images(&images).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_packaging_publishes_nothing() {
        let tmp = TempDir::new().unwrap();
        let rootfs = sample_rootfs(tmp.path());
        let images = tmp.path().join("images");
        let token = CancelToken::new();
        token.cancel();

        let packager = ArtifactPackager::new(&images, &in_process()).with_cancel(&token);
        assert!(packager
            .package(&BuildConfig::new("t1", "debian", "12"), &rootfs)
            .is_err());
        assert_eq!(fs::read_dir(&images).unwrap().count(), 0);
    }

    #[test]
    fn test_list_and_delete_images() {
        let tmp = TempDir::new().unwrap();
        let images = tmp.path();
        fs::write(images.join("a-debian-12.tar.zst"), b"a").unwrap();
        fs::write(images.join("notes.txt"), b"n").unwrap();
        fs::write(images.join(".b-debian-12.tar.zst.partial-1"), b"p").unwrap();
        fs::create_dir_all(images.join(".build_states")).unwrap();

        let listed = list_images(images).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a-debian-12.tar.zst");
        assert_eq!(listed[0].size_bytes, 1);

        assert!(delete_image(images, "a-debian-12.tar.zst").unwrap());
        assert!(!delete_image(images, "a-debian-12.tar.zst").unwrap());
        assert!(delete_image(images, "../escape.tar.zst").is_err());
        assert!(delete_image(images, "notes.txt").is_err());
    }

    #[test]
    fn test_split_device() {
        // /dev/null is 1:3, /dev/tty is 5:0
        assert_eq!(split_device(0x0103), (1, 3));
        assert_eq!(split_device(0x0500), (5, 0));
    }
}
