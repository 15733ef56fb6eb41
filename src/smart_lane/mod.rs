//! Smart-lane analysis
//!
//! The deeper of the two execution paths: full risk assessment, technical
//! signals, position sizing and exit strategy, synthesized into one
//! recommendation within a tight pipeline deadline.

pub mod exits;
pub mod pipeline;
pub mod sizing;
pub mod technical;

pub use exits::{ExitLevel, ExitStrategy, ExitStrategyManager, ExitTrigger};
pub use pipeline::{SmartLaneAnalysis, SmartLanePipeline, SmartLaneRecommendation};
pub use sizing::{PositionSizer, SizingCalculation, SizingInputs, SizingMethod};
pub use technical::{SignalDirection, TechnicalSignal, TechnicalSummary};
