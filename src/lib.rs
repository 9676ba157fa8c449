//! LOS: life-tracking records kept in sync between the mobile client and
//! the desktop/server store.
//!
//! The sync engine itself lives in `los-sync-core`; this crate supplies
//! the SQLite stores, the HTTP server and client, and the `los` CLI.

pub mod commands;
pub mod config;
pub mod db;
pub mod server;
pub mod summary;
pub mod sync;
