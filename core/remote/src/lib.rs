//! Remote system abstraction for ShopSync.
//!
//! This module provides a trait-based interface for the system of record
//! the engine synchronizes against, a handful of adapters, and a registry
//! for resolving adapters by name and configuration.
//!
//! # Design Principles
//! - Backend isolation: the sync engine depends only on [`RemoteSystem`]
//! - Structured conflicts: divergence is reported as `Error::Conflict`,
//!   never as a generic failure
//! - Remote naming: every payload crossing this boundary is snake_case

pub mod file;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod rest;

pub use file::FileRemote;
pub use memory::{Fault, MemoryRemote};
pub use provider::{RemoteRecord, RemoteSystem};
pub use registry::{create_default_registry, RemoteFactory, RemoteRegistry};
pub use rest::{RestConfig, RestRemote};
