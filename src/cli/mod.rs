pub mod associate;
pub mod ingest;
pub mod list;
pub mod reconcile;
pub mod serve;
pub mod show;
pub mod stats;
pub mod submit;
