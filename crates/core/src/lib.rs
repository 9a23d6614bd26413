pub mod branch;
pub mod cascade;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod lineage;
pub mod repair;
pub mod scope;
pub mod summaries;
pub mod tree;

pub use branch::Draft;
pub use cascade::DeletionPlan;
pub use controller::{Generation, SessionController};
pub use error::{CoreError, CoreResult};
pub use lifecycle::{StatusTransition, TransitionRejection, apply_transition};
pub use lineage::{context_messages, lineage};
pub use repair::RepairReport;
pub use tree::{TreeIndex, TreeViolation};
