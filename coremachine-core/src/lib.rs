mod ids;
mod types;

// We do this pattern (privately use a module, then re-export parts of it) so we
// can refactor or rename the internals without breaking the public API.

pub use ids::advisory_lock_key;
pub use ids::canonical_json;
pub use ids::job_fingerprint;
pub use ids::lineage_fingerprint;
pub use ids::task_fingerprint;

pub use types::Job;
pub use types::JobQueueMessage;
pub use types::JobStatus;
pub use types::StageAggregate;
pub use types::Task;
pub use types::TaskDefinition;
pub use types::TaskQueueMessage;
pub use types::TaskStatus;

mod error;
pub use error::ErrorKind;
pub use error::MachineError;
pub use error::PlatformError;
pub use error::QueueError;
pub use error::StateError;

mod config;
pub use config::CoreConfig;
pub use config::PoolConfig;

mod retry;
pub use retry::RetryPolicy;

mod queue;
pub use queue::DeadLetter;
pub use queue::Delivery;
pub use queue::MessageQueue;

mod blob;
pub use blob::BlobError;
pub use blob::BlobStore;
pub use blob::MemoryBlobStore;

mod repo;
pub use repo::JobPatch;
pub use repo::JobTaskRepo;
pub use repo::NewTask;
pub use repo::TaskStatusCounts;

mod state;
pub use state::AdvanceOutcome;
pub use state::CompletionOutcome;
pub use state::StateManager;

mod registry;
pub use registry::FinalizeContext;
pub use registry::Handler;
pub use registry::HandlerFailure;
pub use registry::HandlerRegistry;
pub use registry::JobSpec;
pub use registry::SpecError;

mod orchestration;
pub use orchestration::OrchestrationManager;

mod machine;
pub use machine::CoreMachine;

pub mod pipelines;

mod platform;
pub use platform::BlobRef;
pub use platform::PlatformLayer;
pub use platform::PlatformRequest;
pub use platform::PlatformResult;

/// Key under which an oversized task result is replaced by a blob reference.
pub const BLOB_REF_KEY: &str = "$blob";
