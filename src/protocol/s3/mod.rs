//! S3 upload through presigned URLs
//!
//! Files are uploaded to an S3-compatible object store without holding any
//! object-store credentials: a companion broker hands out presigned PUT URLs
//! and performs the multipart bookkeeping (complete, abort, finalize).
//!
//! # Upload paths
//!
//! - Files smaller than `ChunkSizeMB` MiB are uploaded with one PUT.
//! - Larger files are split into `ceil(size / chunk)` parts. Parts run on a
//!   process-wide pool of `PoolSize` permits but are grouped per file and per
//!   task, so cancelling one task only stops its own parts.
//!
//! Every PUT carries `x-amz-checksum-sha256` with the base64 SHA-256 of its
//! body. The multipart completion carries
//! `base64(sha256(raw part digest 1 || ... || raw part digest n))`.
//!
//! # Failure handling
//!
//! Part PUTs and broker RPCs are retried on transient failures. Once an
//! upload id has been obtained, any failure (including cancellation) ends in
//! exactly one `abortMultipartUpload` call for that id.

mod broker;
mod checksum;
mod store;
mod types;
mod uploader;

pub use broker::{BrokerClient, PresignedUrlBroker};
pub use checksum::{compose_checksum, decode_presigned_url, sha256, strip_etag_quotes, to_base64};
pub use store::{HttpObjectStore, ObjectStore, CHECKSUM_HEADER};
pub use types::{CompletePart, FinalizeDatasetRequest, PresignedUpload};
pub use uploader::{object_name, part_pool, S3Uploader, OBJECT_PREFIX};

/// One mebibyte
pub const MIB: u64 = 1024 * 1024;
