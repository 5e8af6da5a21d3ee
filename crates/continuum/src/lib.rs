//! Continuum persistence and segment lifecycle.

pub mod continuum;
pub mod segments;
pub mod uow;

pub use continuum::{Continuum, ContinuumDelta, ContinuumRepository};
pub use segments::{CollapseOutcome, SegmentInfo, SegmentService, SENTINEL_PLACEHOLDER};
pub use uow::UnitOfWork;
