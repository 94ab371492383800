//! Background work: conversion jobs and task cleanup.
//!
//! - `runner`: executes one conversion per task, off the request path
//! - `cleanup`: deferred reclamation timers and stale-workspace sweeps

pub mod cleanup;
pub mod runner;

pub use cleanup::{CleanupOutcome, CleanupScheduler, SweepReport, spawn_sweep_task};
pub use runner::JobRunner;
