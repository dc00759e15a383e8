pub mod bridge;
pub mod cli;
pub mod engine;
pub mod error;
pub mod stats;
pub mod utils;

pub use cli::config::EngineConfig;
pub use engine::control::ScenarioPhase;
pub use engine::plan::{DelugePlan, ScenarioPlan};
pub use engine::{Engine, RunHandle};
pub use error::{ConfigurationError, IterationFailure, TransportError, TransportErrorKind};
pub use stats::{RunReport, Status};
pub use utils::parse_duration;
