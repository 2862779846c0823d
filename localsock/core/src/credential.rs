//! Peer Credentials
//!
//! Kernel-reported identity (`SO_PEERCRED` on Linux) of the process at the
//! other end of an accepted connection.

use std::fmt;

/// Value of a credential field the provider has not filled
pub const UNFILLED: i32 = -1;

/// Identity of a connected peer
///
/// All ids start out as [`UNFILLED`] rather than `0`, so a provider that
/// silently fails to fill them never reports the peer as root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCredential {
    /// Process id
    pub pid: i32,
    /// User id
    pub uid: i32,
    /// Group id
    pub gid: i32,
    /// Process name (first `/proc/<pid>/cmdline` entry), if readable
    pub process_name: Option<String>,
    /// Full command line with NULs replaced by spaces, if readable
    pub cmdline: Option<String>,
}

impl Default for PeerCredential {
    fn default() -> Self {
        Self {
            pid: UNFILLED,
            uid: UNFILLED,
            gid: UNFILLED,
            process_name: None,
            cmdline: None,
        }
    }
}

impl PeerCredential {
    /// Create a credential from raw ids
    #[must_use]
    pub fn new(pid: i32, uid: i32, gid: i32) -> Self {
        Self {
            pid,
            uid,
            gid,
            ..Self::default()
        }
    }

    /// Whether the provider filled in a usable uid
    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.uid >= 0
    }

    /// Fill `process_name` and `cmdline` from `/proc/<pid>/cmdline`
    ///
    /// Processes of other users are usually not readable; in that case the
    /// fields stay `None`.
    pub fn fill_process_info(&mut self) {
        if self.pid <= 0 || self.process_name.is_some() {
            return;
        }

        let Ok(raw) = std::fs::read(format!("/proc/{}/cmdline", self.pid)) else {
            return;
        };
        if raw.is_empty() {
            return;
        }

        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();

        self.process_name = args.first().cloned();
        self.cmdline = Some(args.join(" "));
    }

    /// `pid` or `pid (name)`
    #[must_use]
    pub fn process_string(&self) -> String {
        match self.process_name.as_deref() {
            Some(name) if !name.is_empty() => format!("{} ({name})", self.pid),
            _ => self.pid.to_string(),
        }
    }

    /// Short description used in logs and disallowed-peer errors
    #[must_use]
    pub fn minimal_string(&self) -> String {
        format!(
            "process={}, user={}, group={}",
            self.process_string(),
            self.uid,
            self.gid
        )
    }
}

impl fmt::Display for PeerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.minimal_string())
    }
}
