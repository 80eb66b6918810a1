//! Room playback state
//!
//! `room` holds the per-room timeline model, `authority` serializes and
//! authorizes transitions, `directory` abstracts the external room and queue
//! services.

pub mod authority;
pub mod directory;
pub mod room;

pub use authority::PlaybackAuthority;
pub use directory::{InMemoryCatalog, RoomDirectory, TrackQueue};
pub use room::{Room, Track};
