#![forbid(unsafe_code)]

//! Shared building blocks for the tubelink backend: configuration, filename
//! handling, URL resolution and the streaming download relay.

pub mod config;
pub mod filename;
pub mod logging;
pub mod relay;
pub mod resolver;
pub mod security;
