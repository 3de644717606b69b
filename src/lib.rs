pub mod config;
pub mod db;
pub mod error;
pub mod feeds;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod routes;
pub mod scheduler;
pub mod store;
