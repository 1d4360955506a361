//! Dockyard Library
//!
//! Turns a git repository reference into a supervised, routed process.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod proxy;
pub mod server;
pub mod storage;
pub mod utils;
