//! Core types, configuration and schedules for stylus fine-tuning.
//!
//! This crate provides the foundational pieces shared by the trainer and the
//! command-line front end:
//!
//! - YAML training configuration with a retained raw document
//! - Curriculum thresholds and resumable training state
//! - One-cycle learning rate schedules
//! - The metrics sink abstraction
//! - Error handling infrastructure

#![warn(missing_docs)]

mod config;
mod error;
pub mod scheduler;
mod traits;
mod types;

pub use config::*;
pub use error::*;
pub use scheduler::{OneCycleBuilder, OneCycleSchedule};
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Result, StylusError};
    pub use crate::scheduler::{OneCycleBuilder, OneCycleSchedule};
    pub use crate::traits::*;
    pub use crate::types::*;
}
