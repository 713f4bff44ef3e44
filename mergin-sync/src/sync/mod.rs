pub mod chunker;
pub mod coordinator;
pub mod diff;
pub mod indexer;
pub mod metadata;
pub mod paths;
pub mod transaction;
