pub mod progress;
pub mod summary;

pub use progress::{ProgressEvent, ProgressSink};
pub use summary::RunSummary;
