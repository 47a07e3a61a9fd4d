//! # Registry Infrastructure
//!
//! Lookup of worker definitions and secrets. The [`WorkerDirectory`] trait is
//! the seam to whatever configuration source a deployment uses;
//! [`InMemoryWorkerDirectory`] backs tests and embedded setups.

pub mod worker_directory;

// Re-export main types for easy access
pub use worker_directory::{InMemoryWorkerDirectory, WorkerDirectory};
