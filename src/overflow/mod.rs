//! Overflow log
//!
//! Batches that could not be committed are kept on disk as chunks: a few
//! `#` comment lines describing the failure followed by one encoded event
//! per line. The worker replays them once the store is reachable again.

pub mod codec;
pub mod log;
pub mod recovery;

pub use codec::{
    encode_chunks, parse_chunks, ChunkCodecError, ChunkCodecResult, ChunkReader, OverflowChunk,
    COMMENT_PREFIX,
};
pub use log::{OverflowError, OverflowLog, OverflowResult, WriteMode};
pub use recovery::{RecoveryManager, RecoveryReport, RecoverySource};
