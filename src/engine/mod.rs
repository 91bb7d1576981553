pub mod engine;
pub mod opportunity;
pub mod spread;

pub use engine::{EngineCommand, EngineConfig, EngineSnapshot, OpportunityEngine};
pub use opportunity::{
    ActiveOpportunity, AlertEvent, CloseReason, ClosedOpportunity, Direction, OpportunityId,
    SpreadSnapshot,
};
pub use spread::compute_spread;
