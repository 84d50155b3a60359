//! HTTP and upgrade request handlers.

pub mod api;
pub mod media;
