pub mod active_files;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extract;
pub mod flow;
pub mod notify;
pub mod record;
pub mod recorder;
pub mod store;
pub mod tracker;
pub mod vendor;

pub use config::Config;
pub use coordinator::{PersistenceCoordinator, WriteOutcome};
pub use error::{RecorderError, Result};
pub use flow::FlowEvent;
pub use record::{FileAssociation, PromptFilter, PromptRecord, Source};
pub use recorder::{Recorder, Submission};
pub use vendor::{VendorRegistry, VendorSchema};
