//! # Relay Engine
//!
//! Streaming transfer engine for relaying remote media through a
//! fetch → transcode → split pipeline:
//!
//! - [`ChunkedFetcher`] pulls a remote resource as sequential ranged chunks
//!   (or one pass-through stream when its size is unknown) into an
//!   in-memory pipe.
//! - [`ProgressCounter`] observes the byte stream as a tee, without
//!   affecting backpressure, and derives percentage/ETA figures.
//! - [`PartSplitter`] partitions the unbounded stream into bounded-size
//!   parts for delivery sinks with a per-message payload ceiling.
//! - [`Transcoder`] wires the stream through an external transcoding
//!   process over piped stdio.
//!
//! Session orchestration (one transfer per user, status, cancellation)
//! lives in the `relay-session` crate.

pub mod config;
pub mod error;
pub mod fetch;
pub mod progress;
pub mod resolve;
pub mod split;
pub mod transcode;

pub use config::{DEFAULT_USER_AGENT, FetcherConfig, create_client};
pub use error::{FetchError, fetch_error_from_io};
pub use fetch::{ChunkedFetcher, FETCH_CHUNK_SIZE, MediaStream};
pub use progress::{ProgressCounter, ProgressError, observe};
pub use resolve::{MediaResolver, ResolveError, ResolvedMedia};
pub use split::{DEFAULT_MAX_PART_BYTES, Part, PartSplitter, expected_parts};
pub use transcode::{TranscodeError, TranscodeSpec, Transcoder};
