//! # gyrotrack-replay
//!
//! Feeds captured trainer notifications through the gyrotrack engine without a
//! Bluetooth connection.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod logging;
pub mod replay;
