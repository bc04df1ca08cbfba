//! ICY stream protocol: header handling and metadata reframing.

pub mod headers;
pub mod icy;

pub use headers::{find_header_end, ClientRequest, ResponseHeaders};
pub use icy::{
    decode_metadata_text, extract_value, parse_metadata_block, Demuxed, IcyDemuxer, IcyFormatter,
    MetaInterval,
};
