//! Client-side batching output pipe for the Taskmill ingestion server.
//!
//! Applications construct events (via their own logging layer), hand them to
//! a [`pipe::BatchingPipe`], and the pipe ships size/time-bounded batches to
//! the server with bounded retry. Delivery is best-effort, at-most-once.

pub mod config;
pub mod pipe;
pub mod stats;
pub mod transport;

pub use config::PipeConfig;
pub use pipe::BatchingPipe;
pub use stats::{PipeStatistics, StatsCollectingTransport};
pub use transport::{EventTransport, HttpEventTransport};
