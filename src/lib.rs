//! Login through the New Taipei City education OpenID provider.
//!
//! [`auth`] turns a verified provider response into a [`auth::UserRecord`],
//! [`authz`] decides whether that user may log in, and [`service`] runs the
//! flow between them. [`routes`] mounts the flow on an axum router.

pub mod auth;
pub mod authz;
pub mod config;
#[cfg(feature = "server")]
pub mod observability;
pub mod routes;
pub mod service;
