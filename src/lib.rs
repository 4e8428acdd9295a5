//! # Sinapsi Alfa - Modbus TCP driver for the Alfa energy monitor
//!
//! A Rust driver for the Sinapsi Alfa smart-meter gateway ("Chain 2" energy
//! monitor), polling its Modbus TCP register map and publishing decoded
//! energy, power and tariff values.
//!
//! ## Features
//!
//! - **Async-first**: Tokio runtime, one short-lived connection per cycle
//! - **Batched reads**: the full register map in six holding-register reads
//! - **Resilient**: error-class-aware retries, buffer flushing, connection
//!   resets and a per-cycle protocol-error budget
//! - **Failure tracking**: threshold-gated issues, one-shot recovery actions
//!   and downtime reporting
//! - **Configuration**: YAML-based configuration with validation
//!
//! ## Architecture
//!
//! The crate follows a modular architecture with clear separation of concerns:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `registers`: Sensor catalog and register-batch layout
//! - `modbus`: Modbus TCP transport and retrying batch reader
//! - `client`: Poll orchestration, decoding and derived values
//! - `watchdog`: Consecutive-failure tracking and recovery
//! - `driver`: Scan-interval loop and snapshot publishing

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod modbus;
pub mod registers;
pub mod watchdog;

pub use client::AlfaClient;
pub use config::Config;
pub use error::{AlfaError, Result};
