//! CLI command modules.

pub mod agents;
pub mod cluster;
pub mod http;
pub mod status;
pub mod tasks;
