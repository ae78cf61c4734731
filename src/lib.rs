//! MP Decision Orchestrator
//!
//! Decides, once per cycle, which Model Portfolio (MP) and which per-asset-class
//! Sub-MPs to recommend:
//! - Quant and Narrative agents analyse the cycle's context in parallel
//! - A Risk agent checks divergence, constraints and whipsaw
//! - A Supervisor selects the MP inside the closed candidate set
//! - Sub-Allocators pick one Sub-MP per funded asset class
//! - The Merger validates, applies the quality gate and persists the Decision
//! - The Replay evaluator scores decision stability over history
//!
//! CYCLE:
//! CONTEXT → {QUANT ∥ NARRATIVE} → RISK → SUPERVISOR → {SUB-ALLOCATORS ∥} → MERGE → PERSIST

pub mod agents;
pub mod api;
pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod gemini;
pub mod mirror;
pub mod models;
pub mod orchestrator;
pub mod replay;
pub mod state;
pub mod supervisor;
pub mod verification;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::{CycleOutcome, Orchestrator};
