pub mod batch_tracker;
pub mod categories;
pub mod export;
pub mod inference;
pub mod normalize;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod stager;
pub mod uploads;
