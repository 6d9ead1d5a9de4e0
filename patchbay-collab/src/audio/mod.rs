//! Audio side-channel: clips live outside the replicated document.
//!
//! The document stores only small object keys; this module moves the actual
//! sample data through the room's HTTP blob store and keeps a local cache in
//! step with whatever keys the document currently references.

pub mod clip;
pub mod transfer;

pub use clip::{AudioClip, ClipError};
pub use transfer::{AudioEvent, AudioStore, AudioSync, TransferError};
