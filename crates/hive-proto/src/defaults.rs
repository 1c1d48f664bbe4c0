//! Tunable operational defaults for the hive control plane.
//!
//! Protocol-level identifiers (dRPC modules and methods) live in
//! [`crate::drpc`]. This module centralizes the configurable defaults that
//! can be overridden via CLI flags.

use std::time::Duration;

// ─── Sockets and Paths ──────────────────────────────────────────────────────

/// Default directory holding the control-plane and engine dRPC sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/hive_server";

/// File name of the control-plane dRPC listener socket inside the socket dir.
pub const CONTROL_SOCKET_NAME: &str = "hive_server.sock";

/// File name of the superblock inside an engine's SCM mount.
pub const SUPERBLOCK_NAME: &str = "superblock";

/// Default path of the engine binary.
pub const DEFAULT_ENGINE_BIN: &str = "hive_engine";

// ─── Membership ─────────────────────────────────────────────────────────────

/// Default membership authority port.
pub const DEFAULT_AUTHORITY_PORT: u16 = 10001;

/// Default timeout for a single join round trip.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Control Channel ────────────────────────────────────────────────────────

/// Default timeout for a single dRPC call to an engine.
pub const DEFAULT_DRPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum encoded size of a single dRPC or join message (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

// ─── Engine Resources ───────────────────────────────────────────────────────

/// Default number of I/O targets per engine.
pub const DEFAULT_TARGET_COUNT: u32 = 8;

/// Default hugepage size in megabytes.
pub const DEFAULT_HUGEPAGE_SIZE_MB: u32 = 2;

/// Capacity of the instance event broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 256;
