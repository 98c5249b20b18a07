//! Helper modules and tooling for pixsim pipelines.
//!
//! This crate provides a small set of ready-made modules useful for
//! assembling test benches, and the `pixsim` command-line runner which
//! executes a configuration file with these modules registered.
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]

pub mod helper_modules;
pub mod messages;

pub use helper_modules::register_helper_modules;
