//! Preflight checks for build validation.
//!
//! Validates that the host has the tools the pipeline shells out to before a
//! build record is created. A missing tool is a hard precondition failure,
//! not a resumable step failure.
//!
//! # Example
//!
//! ```rust
//! use rootfs_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("debootstrap") {
//!     println!("debootstrap not installed");
//! }
//!
//! let tools = &[("debootstrap", "debootstrap"), ("chroot", "coreutils")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::process;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Host tools the default step operations need.
///
/// Each tuple is (command_name, package_name). `tar` is only needed when the
/// archive is produced through the host tool, but it is cheap to require.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("debootstrap", "debootstrap"),
    ("chroot", "coreutils"),
    ("tar", "tar"),
];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: sudo apt install {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check that all tools in [`REQUIRED_TOOLS`] are available.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
