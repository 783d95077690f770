//! Session and result entities that flow through the pipeline.

pub mod result;
pub mod session;

pub use result::{CLEAN_RESULT_CODES, ScanResult, Verdict};
pub use session::{RemoteId, Resolution, ScanSession, SessionAction, SessionId, SessionStatus};
