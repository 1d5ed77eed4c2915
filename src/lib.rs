//! Servicerack: supervises the long-running services of local projects.
//!
//! A project groups shell-command services under one root directory. The
//! `supervisor` starts and stops them as child processes, tracks each one's
//! status in the `status` store, and captures their output in the `logs` store.

pub mod catalog;
pub mod clipboard;
pub mod config;
pub mod errors;
pub mod launch;
pub mod logs;
pub mod model;
pub mod outcome;
pub mod registry;
pub mod status;
pub mod supervisor;
pub mod terminal;
