pub mod engine;
pub mod file_state;
pub mod index;
pub mod pool;
pub mod scanner;
pub mod transfer;

pub use engine::{SyncConfig, SyncDirection, SyncEngine, SyncReport};
pub use file_state::{calculate_hash, is_synchronized};
pub use index::{Batches, ResourceIndex};
pub use pool::{JoinSummary, WorkerPool};
pub use scanner::{ScanConfig, ScanSummary, Scanner};
pub use transfer::{ChunkedTransfer, Layout};
