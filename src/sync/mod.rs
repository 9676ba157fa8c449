//! Client side of the sync: the HTTP store that talks to `los-server`.

pub mod client;

pub use client::{HealthResponse, RemoteError, RemoteStore};
