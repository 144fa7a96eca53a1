//! Core domain + application logic for the control relay bot.
//!
//! This crate is framework-agnostic. Telegram, the key store and the control service
//! live behind ports (traits) implemented in adapter crates.

pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod keys;
pub mod logging;
pub mod messaging;
pub mod pending;
pub mod ports;
pub mod router;
pub mod security;
pub mod status;

pub use errors::{Error, Result};
