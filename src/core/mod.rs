// src/core/mod.rs

//! Tasks, scheduling, advice, extension chains and lazy loading, tied together by
//! [`context::Context`].

pub mod advice;
pub mod application;
pub mod chain;
pub mod commons;
pub mod config_loader;
pub mod context;
pub mod error;
pub mod extension;
pub mod lazy;
pub mod plugin;
pub mod project;
pub mod registry;
pub mod scheduler;
pub mod symbols;
pub mod task;
