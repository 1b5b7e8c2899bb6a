pub mod batch;
pub mod metadata;
pub mod processing;
pub mod upload;
