//! Synchronization runtime between `arlo-api` and embedding applications.
//!
//! Keeps a local mirror of one account's devices current by combining the
//! request/response API with the push channel:
//!
//! - **[`Arlo`]** — Entry point. [`connect()`](Arlo::connect) logs in,
//!   enumerates devices, starts the push reader and the refresh jobs, and
//!   waits (bounded) for the first full refresh pass.
//!
//! - **[`StateStore`]** — Key-path JSON store holding every device
//!   attribute, persisted as a versioned snapshot.
//!
//! - **[`DeviceRegistry`]** — Devices keyed by `(id, kind)`; routes push
//!   packets to the right device and publishes [`DeviceEvent`]s.
//!
//! - **[`TaskScheduler`]** — One-shot, delayed and non-overlapping
//!   periodic jobs on a fixed worker pool.
//!
//! - **[`ConnectionManager`]** and **[`StartupBarrier`]** — session
//!   lifecycle and the startup gate.

pub mod arlo;
pub mod barrier;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use arlo::{ACCOUNT_KEY, Arlo};
pub use barrier::StartupBarrier;
pub use config::{ArloConfig, RefreshTimings, TfaConfig, TfaSource};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{CoreError, LastError, StorageError, TaskError};
pub use registry::{Device, DeviceEvent, DeviceKind, DeviceRegistry};
pub use scheduler::{ScheduledTask, TaskId, TaskKind, TaskScheduler};
pub use store::{SNAPSHOT_VERSION, StateSnapshot, StateStore};

// Transport types consumers need alongside the runtime.
pub use arlo_api::{
    MailMessage, Mailbox, MailboxTwoFactor, Packet, TwoFactorKind, TwoFactorSource,
};
