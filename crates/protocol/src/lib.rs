//! Object-storage protocol vocabulary for the multipart transfer engine.
//!
//! Everything the engine exchanges with its transport collaborator lives
//! here: request/response records, object metadata, preconditions,
//! encryption parameters, progress events and the protocol limits that
//! bound part planning.

pub mod constants;
pub mod error;
pub mod go_time;
pub mod messages;
pub mod progress;
pub mod types;

pub use error::TransportError;
pub use progress::{ProgressEvent, ProgressListener};
pub use types::{Conditions, ObjectMeta, ServerSideEncryption};
