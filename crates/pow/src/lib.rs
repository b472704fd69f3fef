//! Compact targets, difficulty and block work.

pub mod difficulty;
