//! Per-task sandbox lifecycle.
//!
//! [`SandboxManager`] is the entry point: it probes the engine, creates and
//! recovers containers, keeps the [`SandboxRegistry`] and the record store in
//! step, and routes commands through the [`CommandExecutor`].

mod events;
mod executor;
mod manager;
mod naming;
mod ports;
mod probe;
mod reaper;
mod registry;
mod types;

pub use events::{EventBus, SandboxEvent};
pub use executor::{
    CommandExecutor, CommandResult, ExecOptions, ExecutedIn, OutputChunk, OutputStream,
    SPAWN_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
pub use manager::{ManagerSettings, ManagerStatus, ReconcileReport, SandboxManager};
pub use naming::{container_name, is_managed_name, NAME_HASH_LEN};
pub use ports::{parse_port_table, resolve_mapped_ports};
pub use probe::{EngineProbe, ProbeSettings};
pub use reaper::{sweep, SweepReport};
pub use registry::SandboxRegistry;
pub use types::{
    IdentityHints, NetworkMode, PortSpec, SandboxConfig, SandboxInstance, SandboxRole,
    SandboxStatus, VolumeMount,
};
