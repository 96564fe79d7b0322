pub mod config;
pub mod naming;
pub mod types;

pub use config::StacklineConfig;
pub use types::*;
