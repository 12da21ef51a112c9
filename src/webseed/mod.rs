//! Web-seed module
//!
//! Fetches missing pieces from HTTP mirrors (BEP 19 / BEP 17 web seeds)
//! alongside the peer path.

pub mod chunks;
pub mod engine;
pub mod file;
pub mod mirror;
pub mod multipart;
pub mod planner;
pub mod registry;
pub mod sink;
pub mod transport;

pub use engine::WebSeedEngine;
pub use file::{file_url, FileId, WebFile};
pub use mirror::{Mirror, MirrorId, MirrorState};
pub use planner::{FileStats, MirrorStats, Planner, TaskId, TaskOutcome};
pub use registry::WebSeedRegistry;
pub use sink::{PieceSink, PieceSnapshot};
pub use transport::{BodyStream, MemoryBody, MirrorResponse, MirrorTransport, ProbeReport, SegmentReader};

#[cfg(feature = "download")]
pub use transport::HttpTransport;
