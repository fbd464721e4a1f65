mod debounce;
mod engine;
mod local_watcher;
pub mod paths;

pub use debounce::Debouncer;
pub use engine::{DEFAULT_DEBOUNCE, ScanReport, SyncEngine, SyncEvent, SyncOutcome};
pub use local_watcher::start_notify_watcher;
