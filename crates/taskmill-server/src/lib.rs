//! Server-side persistence stack for the Taskmill pipeline.
//!
//! Events arrive from the client pipe as task updates; the [`bulk`] engine
//! writes them into rolling storage indices managed by [`lifecycle`], and
//! [`resolve`] reads task state back out, deduplicating across indices.
//! The search backend is abstracted behind [`store::DocumentStore`].

pub mod bulk;
pub mod config;
pub mod jobs;
pub mod lifecycle;
pub mod resolve;
pub mod store;

pub use bulk::BulkEngine;
pub use config::EngineConfig;
pub use lifecycle::IndexLifecycleManager;
pub use resolve::TaskResolver;
pub use store::{DocumentStore, MemoryStore};
