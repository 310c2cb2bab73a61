//! A token authentication server for Docker/OCI registries.
//!
//! Registry clients present credentials (a password or a previously issued
//! refresh token) and receive a short lived JWT access token restricted to
//! the repository actions they are allowed to perform.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod registry;
