pub mod builder;
pub mod catalog;
pub mod config;
pub mod error;
pub mod job;
pub mod naming;
pub mod params;
pub mod selector;
pub mod settings;
pub mod types;
pub mod workflow;
