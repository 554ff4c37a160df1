//! # cardsync testkit
//!
//! Test utilities for cardsync.
//!
//! This crate provides:
//! - Card, folder and tag snapshot builders
//! - Temporary on-disk journal locations
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cardsync_testkit::prelude::*;
//!
//! let card = card("c1", "What is Ohm's law?");
//! let journal = TempJournal::new();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
