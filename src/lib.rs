pub mod assets;
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod pipeline;
pub mod resources;
pub mod safety;
pub mod telemetry;
pub mod utils;
pub mod workers;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, TickOutcome};
