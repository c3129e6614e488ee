//! # Bharat Conversations
//!
//! Keeps one conversation thread per contact. The same person arrives as
//! `+919876543210`, `09876543210` or `98765 43210` depending on the
//! channel; [`phone`] maps those to one canonical key and [`dedup`] folds
//! the threads that piled up under the different spellings.

pub mod dedup;
pub mod phone;

pub use dedup::DedupEngine;
pub use phone::{Normalized, PhoneKey, fallback_key, normalize, phone_key};
