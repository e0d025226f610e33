//! # wharf — substrate for networked services
//!
//! Three tightly coupled subsystems, sharing one buffer discipline:
//!
//! - The chunked byte buffer ([`stream::MemoryStream`]): zero-copy
//!   append/share over reference-counted blocks, scratch spans, markers,
//!   line/token reads, and numeric streaming with explicit byte order.
//! - The HTTP/1.x message machine ([`http`]): strict streaming parser and
//!   composer for requests and replies — header normalization, chunked
//!   transfer coding, gzip/deflate content coding, trailer headers.
//! - The durable record log ([`recordio`], [`logio`]) and the key/value
//!   state keeper layered on it ([`checkpoint`], [`state`]): CRC-chained
//!   framed blocks across rolling files, seek-to-position recovery, change
//!   log + periodic checkpoints.
//!
//! All multi-byte integers in framing are big-endian. Corruption in the
//! record stream is local: readers resynchronize at the next record start
//! and count what they skipped.

pub mod addr;
pub mod checkpoint;
pub mod http;
pub mod logio;
pub mod recordio;
pub mod state;
pub mod stream;
pub mod url;
pub mod zlib;

// Flat re-exports for the most common types.
pub use addr::HostPort;
pub use checkpoint::{read_checkpoint, read_checkpoint_file, CheckpointError, CheckpointWriter};
pub use http::{Header, HttpMethod, HttpVersion, Request, RequestParser, StatusCode};
pub use logio::{LogPos, LogReader, LogWriter};
pub use recordio::{ReadResult, RecordReader, RecordWriter};
pub use state::{StateError, StateKeepUser, StateKeeper};
pub use stream::{DataBlock, MemoryStream};
pub use url::Url;
