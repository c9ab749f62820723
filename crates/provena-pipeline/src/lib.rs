//! Provena Pipeline - lazily evaluated filter outputs
//!
//! A [`Filter`] is a schedulable computation that consumes upstream
//! [`Output`]s and produces its own. Each output holds typed [`Data`] that is
//! resolved on demand: from memory, from persistent storage, by refreshing
//! the data it depends on, or by re-running the filter.

pub mod blob;
pub mod data;
pub mod filter;
pub mod output;
pub mod snapshot;
pub mod storage;
pub mod timestamp;

pub use blob::BlobData;
pub use data::{Data, DataCore, DataType};
pub use filter::{ExecutionContext, Filter, FilterBuilder, FilterKernel, Input};
pub use output::{DataRef, Output, OutputId};
pub use snapshot::{DataManifest, FilterManifest, OutputManifest, MANIFEST_FILE};
pub use storage::{DirStorage, FetchContext, StorageContext, StorageStats, TemporalStorage};
pub use timestamp::{next_timestamp, TimeStamp};
