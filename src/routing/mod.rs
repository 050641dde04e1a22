//! Dynamic stream routing: branch templates and the stream router that
//! links container branches as streams are discovered.

pub mod router;
pub mod template;

pub use router::{EngineCtx, StationGuard, StreamRouter};
pub use template::{BranchTable, BranchTemplate, Destination, ParserKind};
