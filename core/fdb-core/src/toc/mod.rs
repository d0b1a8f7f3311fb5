//! Table of contents: the crash-safe, append-only log of a database.
//!
//! # Architecture
//!
//! - **TocRecord**: fixed header plus a typed payload (INIT, INDEX, CLEAR,
//!   SUBTOC), padded to a fixed alignment
//! - **TocHandler**: appends under `flock`, replays without locking, follows
//!   sub-logs and applies masks
//!
//! Readers see a prefix of the log. Nothing written is ever rewritten; CLEAR
//! records are the only way to retract an index segment or a sub-log.

pub mod handler;
pub mod record;

pub use handler::{IndexEntry, SCHEMA_FILE, SUB_TOC_PREFIX, TOC_FILE, TocHandler, TocOptions};
pub use record::{ClearTarget, RecordHeader, RecordTag, TocPayload, TocRecord};
