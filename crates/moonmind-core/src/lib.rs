//! moonmind-core - shared domain logic for the MoonMind worker.
//!
//! Pure types and state machines: no async runtime, no network, no
//! subprocesses. The daemon crate layers I/O on top of these.

pub mod artifacts;
pub mod config;
pub mod contract;
pub mod events;
pub mod naming;
pub mod redact;
pub mod secret_ref;
pub mod selfheal;
pub mod types;

pub use artifacts::ArtifactUpload;
pub use config::{ConfigError, VaultConfig, WorkerConfig};
pub use contract::{CanonicalTask, StagePlan, TaskContractError};
pub use events::{Stage, StageStatus};
pub use redact::SecretRedactor;
pub use secret_ref::{SecretReferenceError, VaultReference};
pub use selfheal::{FailureClass, HealStrategy, SelfHealConfig};
pub use types::{ClaimedJob, EventLevel, PublishMode, RuntimeKind, WorkdirMode, WorkerRuntime};
