//! # System Interaction Layer
//!
//! This module provides abstractions for interacting with the underlying operating system.
//! The engine never touches the filesystem directly: file-task freshness goes through the
//! [`fs::FileSystem`] collaborator so tests can substitute it.
//!
//! ## Modules
//!
//! - **`fs`**: Modification-time queries used to decide whether a file task is needed.

/// Filesystem queries behind a trait.
pub mod fs;
