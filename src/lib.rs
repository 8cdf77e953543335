use std::sync::Arc;

pub mod actor;
pub mod actuator;
pub mod clock;
pub mod config;
pub mod controller;
pub mod event;
pub mod gateway;
pub mod metrics;
pub mod overrides;
pub mod pipeline;
pub mod policy;
pub mod resolver;
pub mod router;
pub mod scaler;
pub mod service;
pub mod toggles;
pub mod tracker;
pub mod utils;
pub mod workers;

pub type AppConfig = Arc<config::Config>;
