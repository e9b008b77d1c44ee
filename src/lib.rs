pub mod config;
pub mod display;
pub mod models;
pub mod poller;
pub mod relay;
pub mod relay_client;
pub mod resolver;
pub mod store;
pub mod upstream;
