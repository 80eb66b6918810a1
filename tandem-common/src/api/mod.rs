//! API request/response types shared by server and client
//!
//! Pure data definitions with no HTTP framework dependencies.

pub mod types;

pub use types::{
    ErrorResponse, HealthResponse, PlaybackStateResponse, PlaybackStateView, ServerTimeResponse,
    StartPlaybackRequest, USER_ID_HEADER,
};
