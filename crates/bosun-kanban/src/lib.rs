pub mod adapter;
pub mod github;
pub mod local;

pub use adapter::{ClaimOutcome, KanbanAdapter, KanbanError, PrResult, RenewOutcome};
