pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod research;
pub mod session;
