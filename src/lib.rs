//! docconv: asynchronous document conversion service.

pub mod api;
pub mod config;
pub mod converters;
pub mod error;
pub mod service;
pub mod tasks;
pub mod worker;
pub mod workspace;
