//! Base system bootstrap with debootstrap.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::BuildConfig;
use crate::distro::{DebianFlavor, Distribution};
use crate::mirror::MirrorSelector;
use crate::process::Cmd;

use super::StepContext;

const DEBOOTSTRAP: &str = "debootstrap";

/// The debootstrap invocation for one attempt. `mirror` of `None` lets the
/// tool pick its default endpoint.
pub fn debootstrap_command(config: &BuildConfig, rootfs: &Path, mirror: Option<&str>) -> Cmd {
    command(DEBOOTSTRAP, config, rootfs, mirror)
}

fn command(program: &str, config: &BuildConfig, rootfs: &Path, mirror: Option<&str>) -> Cmd {
    let distro = config.distro();
    let components = match distro {
        Distribution::DebianLike(DebianFlavor::Ubuntu) => "main,universe",
        _ => "main",
    };

    let mut cmd = Cmd::new(program)
        .arg("--arch")
        .arg(&config.architecture)
        .arg("--variant=minbase")
        .arg("--include=ca-certificates")
        .arg(format!("--components={components}"))
        .arg(distro.suite_name(&config.version))
        .arg_path(rootfs)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .env("APT_CONFIG", "/dev/null");
    if let Some(mirror) = mirror {
        cmd = cmd.arg(mirror);
    }
    cmd
}

/// Populate `rootfs`, walking the distribution's mirror list.
pub(crate) fn run(
    ctx: &StepContext<'_>,
    config: &BuildConfig,
    rootfs: &Path,
    timeout: Duration,
    sudo: bool,
) -> Result<()> {
    run_with(DEBOOTSTRAP, ctx, config, rootfs, timeout, sudo)
}

fn run_with(
    program: &str,
    ctx: &StepContext<'_>,
    config: &BuildConfig,
    rootfs: &Path,
    timeout: Duration,
    sudo: bool,
) -> Result<()> {
    let attempt = |mirror: Option<&str>| -> Result<()> {
        command(program, config, rootfs, mirror)
            .sudo(sudo)
            .timeout(timeout)
            .cancel(ctx.cancel)
            .run()?;
        Ok(())
    };

    let mirrors = config.distro().mirrors();
    if mirrors.is_empty() {
        return attempt(None).with_context(|| {
            format!(
                "bootstrapping {} {} into {}",
                config.distribution,
                config.version,
                rootfs.display()
            )
        });
    }

    let success = MirrorSelector::new(mirrors.iter().copied(), ctx.events)
        .with_cancel(ctx.cancel)
        .run(|mirror| attempt(Some(mirror)))?;
    tracing::info!(build_id = ctx.build_id, mirror = %success.mirror, "base system created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::events::BuildEvent;
    use crate::mirror::MirrorError;
    use crate::process::CommandError;
    use std::cell::RefCell;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Stand-in debootstrap that logs the mirror it was given (its last
    /// argument) and then runs `on_mirror`, a shell `case` body.
    fn fake_debootstrap(dir: &Path, on_mirror: &str) -> (PathBuf, PathBuf) {
        let log = dir.join("attempts.log");
        let program = dir.join("debootstrap");
        let script = format!(
            "#!/bin/sh\nfor last; do :; done\necho \"$last\" >> '{}'\ncase \"$last\" in\n{on_mirror}\nesac\nexit 0\n",
            log.display()
        );
        fs::write(&program, script).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        (program, log)
    }

    fn attempts(log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn mirror_events(events: &RefCell<Vec<BuildEvent>>) -> (Vec<String>, Vec<String>) {
        let mut tried = Vec::new();
        let mut failed = Vec::new();
        for event in events.borrow().iter() {
            match event {
                BuildEvent::MirrorAttempt { mirror, .. } => tried.push(mirror.clone()),
                BuildEvent::MirrorFailed { mirror, .. } => failed.push(mirror.clone()),
                _ => {}
            }
        }
        (tried, failed)
    }

    #[test]
    fn test_debootstrap_command_for_debian() {
        let config = BuildConfig::new("t1", "debian", "12");
        let cmd = debootstrap_command(
            &config,
            Path::new("/tmp/build_x/rootfs"),
            Some("http://deb.debian.org/debian/"),
        );
        assert_eq!(
            cmd.display(),
            "debootstrap --arch amd64 --variant=minbase --include=ca-certificates \
             --components=main bookworm /tmp/build_x/rootfs http://deb.debian.org/debian/"
        );
    }

    #[test]
    fn test_debootstrap_command_for_ubuntu_without_mirror() {
        let mut config = BuildConfig::new("web", "ubuntu", "22.04");
        config.architecture = "arm64".into();
        let cmd = debootstrap_command(&config, Path::new("/r"), None);
        assert_eq!(
            cmd.display(),
            "debootstrap --arch arm64 --variant=minbase --include=ca-certificates \
             --components=main,universe jammy /r"
        );
    }

    #[test]
    fn test_failed_mirror_falls_through_to_the_next() {
        let tmp = TempDir::new().unwrap();
        let (program, log) = fake_debootstrap(
            tmp.path(),
            "http://deb.debian.org/debian/) echo 'E: Failed getting release file' >&2; exit 1 ;;",
        );
        let rootfs = tmp.path().join("rootfs");
        let events = RefCell::new(Vec::new());
        let sink = |e: &BuildEvent| events.borrow_mut().push(e.clone());
        let token = CancelToken::new();
        let ctx = StepContext {
            build_id: "boot1",
            events: &sink,
            cancel: &token,
        };
        let config = BuildConfig::new("t1", "debian", "12");

        run_with(
            program.to_str().unwrap(),
            &ctx,
            &config,
            &rootfs,
            Duration::from_secs(30),
            false,
        )
        .unwrap();

        assert_eq!(
            attempts(&log),
            vec!["http://deb.debian.org/debian/", "http://ftp.us.debian.org/debian/"]
        );
        let (tried, failed) = mirror_events(&events);
        assert_eq!(
            tried,
            vec!["http://deb.debian.org/debian/", "http://ftp.us.debian.org/debian/"]
        );
        assert_eq!(failed, vec!["http://deb.debian.org/debian/"]);
    }

    #[test]
    fn test_hung_mirror_is_abandoned_after_timeout() {
        let tmp = TempDir::new().unwrap();
        let (program, log) = fake_debootstrap(
            tmp.path(),
            "http://archive.ubuntu.com/ubuntu/) exec sleep 30 ;;",
        );
        let events = RefCell::new(Vec::new());
        let sink = |e: &BuildEvent| events.borrow_mut().push(e.clone());
        let token = CancelToken::new();
        let ctx = StepContext {
            build_id: "boot2",
            events: &sink,
            cancel: &token,
        };
        let config = BuildConfig::new("web", "ubuntu", "22.04");

        let started = std::time::Instant::now();
        run_with(
            program.to_str().unwrap(),
            &ctx,
            &config,
            &tmp.path().join("rootfs"),
            Duration::from_millis(300),
            false,
        )
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(
            attempts(&log),
            vec!["http://archive.ubuntu.com/ubuntu/", "http://us.archive.ubuntu.com/ubuntu/"]
        );
        let (_, failed) = mirror_events(&events);
        assert_eq!(failed, vec!["http://archive.ubuntu.com/ubuntu/"]);
    }

    #[test]
    fn test_every_mirror_failing_surfaces_the_last_error() {
        let tmp = TempDir::new().unwrap();
        let (program, log) = fake_debootstrap(tmp.path(), "*) echo \"E: $last unreachable\" >&2; exit 1 ;;");
        let sink = |_: &BuildEvent| {};
        let token = CancelToken::new();
        let ctx = StepContext {
            build_id: "boot3",
            events: &sink,
            cancel: &token,
        };
        let config = BuildConfig::new("t1", "debian", "12");

        let err = run_with(
            program.to_str().unwrap(),
            &ctx,
            &config,
            &tmp.path().join("rootfs"),
            Duration::from_secs(30),
            false,
        )
        .unwrap_err();

        assert_eq!(attempts(&log).len(), 2);
        match err.downcast_ref::<MirrorError>() {
            Some(MirrorError::Exhausted { attempts, mirror, source }) => {
                assert_eq!(*attempts, 2);
                assert_eq!(mirror, "http://ftp.us.debian.org/debian/");
                assert!(source.downcast_ref::<CommandError>().is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
