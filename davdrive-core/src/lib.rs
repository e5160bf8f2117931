mod client;

pub use client::{
    ChunkMeta, Classified, DavClient, DavError, ErrorClass, classify, classify_error,
    classify_status, mtime_accepted, response_etag, response_file_id, strip_etag_quotes,
};
