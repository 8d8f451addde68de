//! Memory-bounded rechunking of chunked N-dimensional arrays.
//!
//! [`rechunk`] plans a copy of an array, group or dataset into a new chunk layout
//! such that no single block copy holds more than a given number of bytes.
//! When the source and target chunks are incompatible, data is staged through an intermediate array.
//! Copies are run by a pluggable [`executor`].

pub mod algorithm;
mod api;
pub mod chunk;
pub mod config;
mod error;
pub mod executor;
pub mod metadata;
pub mod pipeline;
pub mod storage;
pub mod types;

pub use zarrs;

pub use api::{
    Dataset, RechunkOptions, Rechunked, RechunkedTarget, Source, TargetChunks, TargetChunksSpec,
    Variable, rechunk,
};
pub use config::{MaxMem, MemberOptions, StorageOptions};
pub use error::{Error, Result};
pub use executor::{CopySpecExecutor, ExecuteOptions, get_executor};
