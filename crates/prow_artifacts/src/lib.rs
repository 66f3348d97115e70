//! Artifact-path resolution and side-car metadata records.
//!
//! Maps a ProwJob identity to a stable object-store destination and
//! declares the small JSON blobs written next to the job's artifacts.
//! The resolver is pure; both the metadata reporter and the upload
//! collaborator call it, guaranteeing they agree on where to write.

pub mod metadata;
pub mod path;
pub mod writer;

pub use metadata::{
    CloneCommand, CloneRecord, Finished, Started, BUILD_LOG_TXT, CLONE_LOG_TXT, CLONE_RECORDS_JSON,
    FINISHED_JSON, PROWJOB_JSON, STARTED_JSON, UPLOADER_NAME,
};
pub use path::{kind_segment, path_for_job, repo_segment};
pub use writer::{FsObjectWriter, InMemoryObjectWriter, ObjectWriter};
