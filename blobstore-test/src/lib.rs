//! Test utilities for the blobstore crates.
//!
//! This crate provides utilities to facilitate testing of storage backends. See the modules for all
//! available utilities.

pub mod payload;
pub mod tracing;
