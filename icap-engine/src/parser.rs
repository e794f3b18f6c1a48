//! Streaming ICAP request parser.
//!
//! - [`wire`]: line/chunk framing primitives and status-line constants
//! - [`icap`]: request line, ICAP headers, `Encapsulated`, preview and body reads
//! - [`http_embed`]: the embedded HTTP request/response heads

pub mod http_embed;
pub mod icap;
pub mod wire;

pub use icap::{Encapsulated, parse_encapsulated_value};
pub use wire::{ChunkHeader, parse_chunk_size};

/// Splits a header line into trimmed name and value.
#[inline]
pub fn split_header(line: &str) -> Option<(&str, &str)> {
    line.split_once(':')
        .map(|(name, value)| (name.trim(), value.trim()))
        .filter(|(name, _)| !name.is_empty())
}
