//! Path-level operation modes and longest-prefix mode resolution.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MeshFsError, Result};
use crate::path::MeshPath;

/// Reserved prefix always routed to the primary store.
pub const RESERVED_PRIMARY: &str = "/ignite/primary";
/// Reserved prefix routed straight to the secondary file system.
pub const RESERVED_PROXY: &str = "/ignite/proxy";
/// Reserved prefix for synchronous dual operation.
pub const RESERVED_SYNC: &str = "/ignite/sync";
/// Reserved prefix for asynchronous dual operation.
pub const RESERVED_ASYNC: &str = "/ignite/async";

/// Per-path routing policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Cluster-resident stores only.
    Primary,
    /// Secondary file system only, bypassing the cluster stores.
    Proxy,
    /// Both stores, secondary written synchronously.
    DualSync,
    /// Both stores, secondary written through per-path background batches.
    DualAsync,
}

impl Mode {
    /// True for the two dual modes.
    pub fn is_dual(self) -> bool {
        matches!(self, Mode::DualSync | Mode::DualAsync)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Primary => "PRIMARY",
            Mode::Proxy => "PROXY",
            Mode::DualSync => "DUAL_SYNC",
            Mode::DualAsync => "DUAL_ASYNC",
        };
        f.write_str(s)
    }
}

/// Maps paths to modes using longest-prefix match over a fixed table.
///
/// The table combines reserved prefixes with user-configured ones; user
/// entries colliding with a reserved prefix are skipped with a warning.
/// Without a secondary file system every non-PROXY mode collapses to
/// PRIMARY and a PROXY default is rejected at construction.
#[derive(Debug)]
pub struct ModeResolver {
    default_mode: Mode,
    modes: Vec<(MeshPath, Mode)>,
}

impl ModeResolver {
    /// Builds the resolver from the configured default mode and path table.
    pub fn from_config(
        default_mode: Mode,
        path_modes: &[(String, Mode)],
        has_secondary: bool,
    ) -> Result<Self> {
        if !has_secondary && default_mode == Mode::Proxy {
            return Err(MeshFsError::InvalidArgument(
                "default mode cannot be PROXY if no secondary file system is configured"
                    .to_string(),
            ));
        }

        let effective_default = if has_secondary { default_mode } else { Mode::Primary };

        let mut reserved: Vec<(&str, Mode)> = vec![(RESERVED_PRIMARY, Mode::Primary)];

        if has_secondary {
            reserved.push((RESERVED_PROXY, Mode::Proxy));
            reserved.push((RESERVED_SYNC, Mode::DualSync));
            reserved.push((RESERVED_ASYNC, Mode::DualAsync));
        }

        let mut modes: Vec<(MeshPath, Mode)> = Vec::with_capacity(reserved.len() + path_modes.len());

        for (prefix, mode) in &reserved {
            modes.push((MeshPath::new(prefix)?, *mode));
        }

        for (prefix, mode) in path_modes {
            if reserved.iter().any(|(r, _)| r == prefix) {
                warn!(
                    path = %prefix,
                    mode = %mode,
                    "ignoring path mode because it conflicts with a reserved path"
                );
                continue;
            }

            let path = MeshPath::new(prefix).map_err(|e| {
                MeshFsError::InvalidArgument(format!("invalid path found in mode table: {e}"))
            })?;

            // With no secondary configured, everything except PROXY collapses
            // to PRIMARY; PROXY entries stay and are rejected at use sites.
            let effective = if has_secondary || *mode == Mode::Proxy {
                *mode
            } else {
                Mode::Primary
            };

            modes.push((path, effective));
        }

        Ok(ModeResolver {
            default_mode: effective_default,
            modes,
        })
    }

    /// Resolves the mode of a single path: the longest matching prefix wins,
    /// otherwise the default mode applies.
    pub fn resolve_mode(&self, path: &MeshPath) -> Mode {
        let mut best: Option<(&MeshPath, Mode)> = None;

        for (prefix, mode) in &self.modes {
            if path.is_same(prefix) || path.is_subdirectory_of(prefix) {
                let better = match best {
                    Some((cur, _)) => prefix.as_str().len() > cur.as_str().len(),
                    None => true,
                };

                if better {
                    best = Some((prefix, *mode));
                }
            }
        }

        best.map(|(_, m)| m).unwrap_or(self.default_mode)
    }

    /// The set of modes reachable at or below `path`.
    pub fn resolve_children_modes(&self, path: &MeshPath) -> HashSet<Mode> {
        let mut set = HashSet::new();
        set.insert(self.resolve_mode(path));

        for (prefix, mode) in &self.modes {
            if prefix.is_subdirectory_of(path) {
                set.insert(*mode);
            }
        }

        set
    }

    /// The configured default mode.
    pub fn default_mode(&self) -> Mode {
        self.default_mode
    }

    /// The full mode table in registration order, reserved prefixes first.
    pub fn modes_ordered(&self) -> &[(MeshPath, Mode)] {
        &self.modes
    }
}
