//! DriveCap Shared - common types for the capacity-management core and its tools
//!
//! This crate contains the error taxonomy and the constants that must agree
//! between the core library (drivecap), the command-line tool and the test
//! fixtures.

pub mod constants;
pub mod errors;

pub use errors::{DrivecapError, DrivecapResult};
