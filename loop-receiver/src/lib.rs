pub mod config;
pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod mdns;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;
