//! Stock photo metadata generator
//!
//! This library provides the core of the stock-meta service: uploaded images
//! are staged as compressed temporary copies, described by a vision model,
//! normalized into marketplace metadata and exported as CSV.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
