//! File management.
//!
//! - Content-addressed blob storage with reference counting
//! - File records pointing at blobs
//! - Per-user data size aggregation
//! - Upload, download and deletion service

mod aggregate;
mod record;
mod service;
mod store;

pub use aggregate::AggregateRefresher;
pub use record::{DeletedFile, FileRecord, FileRepository, NewFileRecord};
pub use service::{FileService, PublicFile, Upload};
pub use store::{Blob, ConsistencyReport, ContentStore, PendingBlobs, StagedBlob};

/// Maximum length for a file name (in characters).
pub const MAX_FILENAME_LENGTH: usize = 255;
