pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod locks;
pub mod logger;
pub mod models;
pub mod relay;
pub mod server;
pub mod store;
pub mod tokenizer;
pub mod webhook;
