//! Portcullis - control plane for a self-hosted API gateway
//!
//! This library provides the master-process side of the gateway:
//! - Supervises a pool of worker processes and keeps it at capacity
//! - Performs zero-downtime rolling reloads, one worker at a time
//! - Guards reloads with a crash-storm circuit breaker
//! - Synchronizes configuration from a remote source on a timer
//! - Accepts operator commands over a local control socket
//! - Computes the per-URL plugin execution sequence for workers

pub mod config;
pub mod control;
pub mod error;
pub mod exit_tracker;
pub mod ipc;
pub mod sequencer;
pub mod supervisor;
pub mod sync;
pub mod waiter;
pub mod worker;
