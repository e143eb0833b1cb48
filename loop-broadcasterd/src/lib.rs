pub mod api;
pub mod command_log;
pub mod config;
pub mod mdns;
pub mod server;
pub mod status;
