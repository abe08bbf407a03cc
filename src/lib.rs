pub mod adapter;
pub mod backend;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod events;
pub mod filters;
pub mod http;
pub mod logging;
pub mod model;
pub mod repository;
pub mod runner;
pub mod scheduler;
pub mod telemetry;
pub mod watcher;
pub mod workspace;

pub mod daemon;
