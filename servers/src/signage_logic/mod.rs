pub mod config;
pub mod downstream;
pub mod error;
pub mod handlers;
pub mod logger;
pub mod seed;
pub mod state;
