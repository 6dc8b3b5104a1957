//! nm-monitor: aggregates UDP telemetry broadcast by NMMiner devices into a
//! live, queryable fleet view.

pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod firmware;
pub mod format;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod managed;
pub mod market;
pub mod registry;
pub mod relay;
pub mod web;
