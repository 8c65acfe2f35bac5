#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Job model and durable state for the jobmill engine.
//!
//! This crate holds everything that outlives a process: the job status
//! vocabulary, metadata and result records, the canonical timestamp format,
//! and the on-disk store (journal records, keyed shelves, advisory locks,
//! and the archive directory).

pub mod clock;
pub mod job;
pub mod jobid;
pub mod lock;
pub mod store;
