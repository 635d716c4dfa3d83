pub mod config;
pub mod platform;
pub mod prayer;
pub mod protocol;
pub mod state;
