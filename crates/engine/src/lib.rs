#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process job engine: intake, lane dispatch, worker execution, and the
//! result collector, with durable per-job state and crash recovery.
//!
//! [`start_engine`] spawns the pipeline and returns an [`EngineHandle`];
//! [`JobClient`] is the facade an HTTP layer (or any caller) uses to submit
//! jobs and read status, metadata, and results.

/// Engine configuration, lifecycle handle, and public reply types.
pub mod api;
/// The client facade consumed by the HTTP layer.
pub mod client;
/// Action name resolution and the handler contract.
pub mod registry;

mod callback;
mod collector;
mod engine;
mod intake;
mod lane;
mod recovery;
mod worker;

pub use api::{
    EngineConfig, EngineHandle, LaneSpec, MetadataReply, ResultReply, RetryPolicy,
    StatusCacheConfig, start_engine,
};
pub use callback::{SideChannel, SideChannelConfig};
pub use client::{EngineDown, JobClient, SubmitError, SubmitRequest, WaitError, parse_jobid_list};
pub use registry::{
    ActionContext, ActionNotFound, ActionRegistry, BuiltinRegistry, Handler, HandlerFuture,
    RegistryFactory,
};
