//! Privilege-dropping supervisor for file copy jobs.
//!
//! A [`supervisor::Scheduler`] turns a list of file names into copy tasks,
//! runs each task in a forked child that assumes the identity of the source
//! file's owner, and keeps no more than a configured number of children
//! running at once. The host calls `reconcile()` whenever the file list may
//! have changed and `tick()` on a fixed cadence.

pub mod error;
pub mod supervisor;
pub mod utils;

pub use error::{Result, SupervisorError};
