//! Upstream AI integration: the realtime audio link, its upload buffer, the
//! response demultiplexer, the tool executor, and the post-call analyzer.

pub mod analysis;
pub mod events;
pub mod link;
pub mod tools;
pub mod upload;
