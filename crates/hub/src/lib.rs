//! Sensor connection, calibration and analytics engine for controlled
//! growing rooms.
//!
//! The [`manager::ConnectionManager`] owns every registered device, drives
//! its transport through the [`scheduler`], and feeds each sample through
//! calibration, derived metrics, quality grading, the reading store and
//! threshold evaluation. [`web`] exposes it over HTTP.

pub mod aggregation;
pub mod analytics;
pub mod calibration;
pub mod config;
pub mod derived;
pub mod error;
pub mod manager;
pub mod model;
pub mod quality;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod thresholds;
pub mod transport;
pub mod web;

pub use error::{Result, SensorError};
pub use manager::ConnectionManager;
