pub extern crate actix_web;

pub mod admin;
pub mod authz;
pub mod config;
pub mod connection;
mod connection_tx_storage;
pub mod gateway;
pub mod handlers;
pub mod outbox;
pub mod room;
pub mod server;
mod server_state;
mod session;
pub mod snapshot_file;
pub mod snapshot_store;
pub mod snapshot_writer;
