//! chatvault library crate.
//!
//! An unattended collector worker for live streams: ingests the live chat
//! feed and polls broadcast statistics, durably recording both across
//! network failures, upstream hangs, and mid-flight retargeting.

pub mod backup;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod feed;
pub mod health;
pub mod logging;
pub mod retry;
pub mod stats;
pub mod storage;
pub mod supervisor;
pub mod target;

pub use error::{Error, Result};
