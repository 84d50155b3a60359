//! Request middleware and auth helpers.

pub mod auth;
