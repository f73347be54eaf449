pub mod aggregate;
pub mod app;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod executor;
pub mod fs_util;
pub mod groups;
pub mod hits;
pub mod local;
pub mod output;
pub mod planner;
pub mod scheduler;
pub mod stage;
pub mod store;
pub mod tools;
