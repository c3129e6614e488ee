//! # Bharat Core
//!
//! Shared building blocks for the background worker:
//! configuration, the error taxonomy, the clock abstraction, domain
//! records and the traits for external collaborators (notification
//! dispatcher, telephony provider).

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CrmConfig;
pub use error::{CrmError, Result};
