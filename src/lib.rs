pub mod config;
pub mod engine;
pub mod render;
pub mod vr;

pub use config::AppConfig;
pub use engine::thread::{AppThread, Platform, SimulatedPlatform};
pub use engine::{AppError, FramePipeline, TickOutcome};
pub use vr::session::{InitError, InitStep, TrackingSession};
