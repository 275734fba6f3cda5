//! Input/output helpers.
//!
//! - sky model JSON read/write (`skyfile`)

pub mod skyfile;

pub use skyfile::*;
