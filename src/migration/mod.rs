//! Migration Orchestration
//!
//! Moves a cluster's data to a destination as a resumable job: precheck,
//! one copy task per shard (or per internal kvstore), optional data-check
//! cycles, disconnect, teardown.
//!
//! The job is a state machine advanced by polling:
//!
//! ```text
//! PRECHECK -> EXECUTING <-> DATA_CHECK_REPAIR
//!                 |
//!                 v
//!           DISCONNECTING -> DONE
//!
//! any non-terminal state -> FAILED
//! ```
//!
//! Jobs are persisted after every change, so a restarted process resumes
//! a job by calling `advance()` on it again.

mod engine;
mod errors;
mod job;
mod planner;
mod policy;
mod precheck;
mod state;
mod store;

pub use engine::{AdvanceOutcome, MigrationCollaborators, MigrationEngine, COPY_ACTION, DATA_CHECK_ACTION};
pub use errors::{MigrationError, MigrationResult};
pub use job::{
    JobId, MigrationJob, MigrationRequest, MigrationTask, SourceShard, Step, StepAction, StepStatus, TaskId,
};
pub use policy::{DataCheckPolicy, DataCheckRun, DisconnectPolicy};
pub use state::{JobState, SyncOperate, TaskPhase};
pub use store::{FileMigrationStore, MemoryMigrationStore, MigrationStore, MIGRATION_DIR_NAME};
