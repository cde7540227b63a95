//! # Streaming
//!
//! Gatekeeping for playback: host load, per-link stream caps, sessions and
//! the proof-of-view flow that earns them.

pub mod admission;
pub mod load;
pub mod session;

pub use admission::{
    AdmissionDecision, AdmissionError, AuthorizeRequest, DenyReason, ProofSubmission, StreamAdmission,
};
pub use load::{is_overloaded, FixedLoad, LoadSource, SystemLoad};
pub use session::{client_key, ClaimError, SessionGrant, SessionTable, StreamGuard, StreamSession};
