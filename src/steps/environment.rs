//! User account, `/etc/environment` and working directory.
//!
//! Every part is safe to re-run: an existing account is left alone and
//! variables replace earlier declarations of the same key.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::config::BuildConfig;
use crate::events::BuildEvent;

use super::chroot::Rootfs;
use super::StepContext;

const ENVIRONMENT_FILE: &str = "/etc/environment";

pub(crate) fn run(ctx: &StepContext<'_>, config: &BuildConfig, rootfs: &Rootfs<'_>) -> Result<()> {
    if config.user != "root" {
        let script = config.distro().user_script(&config.user);
        if let Err(err) = rootfs.run_script("create_user", &script) {
            if ctx.cancel.is_cancelled() {
                return Err(err);
            }
            ctx.events.emit(BuildEvent::Warning {
                message: format!("could not create user '{}': {err:#}", config.user),
            });
        }
    }

    if !config.environment_vars.is_empty() {
        let existing = rootfs.read_optional(ENVIRONMENT_FILE)?.unwrap_or_default();
        let merged = merge_environment(&existing, &config.environment_vars);
        rootfs.write_file(ENVIRONMENT_FILE, &merged, 0o644)?;
    }

    if config.working_dir != "/" {
        rootfs.create_dir_all(&config.working_dir)?;
    }

    if ctx.cancel.is_cancelled() {
        bail!("environment setup cancelled");
    }
    Ok(())
}

/// `existing` with every declaration of a key in `vars` replaced.
pub fn merge_environment(existing: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for line in existing.lines() {
        let key = line
            .trim_start()
            .strip_prefix("export ")
            .unwrap_or(line.trim_start())
            .split('=')
            .next()
            .unwrap_or("")
            .trim();
        if line.contains('=') && vars.contains_key(key) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    for (key, value) in vars {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}
