pub mod config;
pub mod logging;
pub mod resilience;

pub use config::Config;
