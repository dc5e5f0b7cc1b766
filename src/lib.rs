pub mod app;
pub mod bundle;
pub mod checksum;
pub mod command;
pub mod config;
pub mod destination;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod fs_util;
pub mod genome;
pub mod output;
pub mod registry;
pub mod stage;
pub mod stages;
