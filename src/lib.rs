pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod game;
pub mod hub;
pub mod protocol;
pub mod repository;
pub mod tokens;
pub mod types;
