//! Statement Service - bank and credit-card statement ingestion with
//! bounded-concurrency processing, rule-based categorization and recurring
//! charge detection.

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
