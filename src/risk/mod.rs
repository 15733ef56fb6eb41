//! Risk assessment
//!
//! Categorized parallel evaluation of newly discovered pairs: a cache with
//! per-category TTLs in front of an engine that fans out to the analyzer
//! set, aggregates a confidence-weighted score and applies blocking rules.

pub mod analyzers;
pub mod cache;
pub mod engine;
pub mod types;

pub use cache::RiskCache;
pub use engine::RiskEngine;
pub use types::{
    AnalysisContext, DataQuality, RiskAssessment, RiskCategory, RiskCategoryScore,
};
