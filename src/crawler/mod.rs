//! # Crawler Module
//!
//! The engine-facing side of the control plane.
//!
//! ## Overview
//!
//! The crawl engine itself (scheduling, downloading, parsing) lives outside this crate.
//! It talks to the control plane through the hook surface of [`ControlPlane`], which
//! runs each request and response through the middleware chain and feeds extracted
//! records to the pipelines.
//!
//! ## Internal Components
//!
//! - `MiddlewareManager`: the shared, lock-free middleware chain
//! - `spawn_item_processor_task`: the task that runs records through the pipelines

mod core;
mod item_processor;
mod middleware_manager;

pub use core::ControlPlane;
pub use middleware_manager::MiddlewareManager;
