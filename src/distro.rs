//! Distribution adapter.
//!
//! Maps a `(distribution, version)` pair onto the bits of tooling knowledge the
//! build steps need: the bootstrap suite token, the mirror list the bootstrap
//! step walks, and the package-manager / account-creation scripts that run
//! inside the rootfs.
//!
//! Nothing here touches the filesystem. Unknown distributions are not an
//! error: they map to [`Distribution::Unsupported`], whose package script
//! reports the missing support and exits cleanly so that builds with an empty
//! package list still go through.

use std::fmt;

/// Flavors of the Debian family, which share apt and debootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebianFlavor {
    Debian,
    Ubuntu,
}

/// A target distribution, resolved from the configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Distribution {
    DebianLike(DebianFlavor),
    Fedora,
    Centos,
    Alpine,
    Unsupported(String),
}

const UBUNTU_SUITES: &[(&str, &str)] = &[
    ("24.04", "noble"),
    ("22.04", "jammy"),
    ("20.04", "focal"),
    ("18.04", "bionic"),
];

const DEBIAN_SUITES: &[(&str, &str)] = &[
    ("12", "bookworm"),
    ("11", "bullseye"),
    ("10", "buster"),
];

const UBUNTU_MIRRORS: &[&str] = &[
    "http://archive.ubuntu.com/ubuntu/",
    "http://us.archive.ubuntu.com/ubuntu/",
    "http://mirror.math.princeton.edu/pub/ubuntu/",
];

const DEBIAN_MIRRORS: &[&str] = &[
    "http://deb.debian.org/debian/",
    "http://ftp.us.debian.org/debian/",
];

impl Distribution {
    /// Resolve a distribution name. Matching is case-insensitive.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "debian" => Self::DebianLike(DebianFlavor::Debian),
            "ubuntu" => Self::DebianLike(DebianFlavor::Ubuntu),
            "fedora" => Self::Fedora,
            "centos" => Self::Centos,
            "alpine" => Self::Alpine,
            _ => Self::Unsupported(name.trim().to_string()),
        }
    }

    /// Canonical lowercase identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::DebianLike(DebianFlavor::Debian) => "debian",
            Self::DebianLike(DebianFlavor::Ubuntu) => "ubuntu",
            Self::Fedora => "fedora",
            Self::Centos => "centos",
            Self::Alpine => "alpine",
            Self::Unsupported(name) => name.as_str(),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }

    /// Bootstrap suite token for `version`.
    ///
    /// Debian-family numeric versions resolve to their codename; anything not
    /// in the table (including codenames themselves) passes through unchanged.
    pub fn suite_name(&self, version: &str) -> String {
        let table = match self {
            Self::DebianLike(DebianFlavor::Debian) => DEBIAN_SUITES,
            Self::DebianLike(DebianFlavor::Ubuntu) => UBUNTU_SUITES,
            _ => return version.to_string(),
        };
        table
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, suite)| suite.to_string())
            .unwrap_or_else(|| version.to_string())
    }

    /// Bootstrap endpoints in priority order. Empty means "tool default".
    pub fn mirrors(&self) -> &'static [&'static str] {
        match self {
            Self::DebianLike(DebianFlavor::Debian) => DEBIAN_MIRRORS,
            Self::DebianLike(DebianFlavor::Ubuntu) => UBUNTU_MIRRORS,
            _ => &[],
        }
    }

    /// Shell script installing `packages` with this distribution's package
    /// manager, then cleaning its caches.
    pub fn package_script(&self, packages: &[String]) -> String {
        let list = packages
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ");

        match self {
            Self::DebianLike(_) => format!(
                "#!/bin/bash\n\
                 set -e\n\
                 export DEBIAN_FRONTEND=noninteractive\n\
                 \n\
                 apt-get update\n\
                 apt-get install -y {list}\n\
                 \n\
                 apt-get clean\n\
                 rm -rf /var/lib/apt/lists/*\n"
            ),
            Self::Fedora => format!(
                "#!/bin/bash\n\
                 set -e\n\
                 \n\
                 dnf install -y {list}\n\
                 \n\
                 dnf clean all\n"
            ),
            Self::Centos => format!(
                "#!/bin/bash\n\
                 set -e\n\
                 \n\
                 yum install -y {list}\n\
                 \n\
                 yum clean all\n"
            ),
            Self::Alpine => format!(
                "#!/bin/sh\n\
                 set -e\n\
                 \n\
                 apk update\n\
                 apk add {list}\n\
                 \n\
                 rm -rf /var/cache/apk/*\n"
            ),
            Self::Unsupported(name) => format!(
                "#!/bin/sh\n\
                 echo {} >&2\n\
                 exit 0\n",
                shell_quote(&format!("Package installation not supported for {name}"))
            ),
        }
    }

    /// Shell script creating `user` if it does not exist yet.
    pub fn user_script(&self, user: &str) -> String {
        let quoted = shell_quote(user);
        match self {
            Self::Alpine => format!(
                "#!/bin/sh\n\
                 set -e\n\
                 \n\
                 if ! id -u {quoted} >/dev/null 2>&1; then\n\
                 \x20   adduser -D -s /bin/sh {quoted}\n\
                 fi\n"
            ),
            _ => format!(
                "#!/bin/sh\n\
                 set -e\n\
                 \n\
                 if ! id -u {quoted} >/dev/null 2>&1; then\n\
                 \x20   useradd -m -s /bin/bash {quoted}\n\
                 fi\n\
                 \n\
                 if command -v sudo >/dev/null 2>&1 && getent group sudo >/dev/null 2>&1; then\n\
                 \x20   usermod -aG sudo {quoted}\n\
                 fi\n"
            ),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | ':' | '/' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
