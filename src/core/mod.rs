pub mod config;
pub mod connection;
pub mod engine;
pub mod transfer;
