//! Clock synchronization and drift correction

pub mod clock;
pub mod drift;
pub mod history;
pub mod position;

pub use clock::{adaptive_tolerance, ClockEstimate, ClockSyncEstimator, HttpTimeSource, TimeSource};
pub use drift::{AudioEngine, ClientSyncState, DriftCorrector, SyncOutcome, SyncStatus};
pub use history::{SyncEntry, SyncHistory};
pub use position::RoomSnapshot;
