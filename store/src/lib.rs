//! Durable storage of coverage measurements.
//!
//! The data file is a SQLite database: a row per measured file and context,
//! executed line sets packed into numbits blobs, executed branch transitions
//! as arc rows. [`CoverageData`] is the supported API over it; the schema is
//! the on-disk compatibility contract and is versioned, so query through the
//! API rather than the file.

mod aliases;
mod data;
mod numbits;
mod sqlite;

pub use aliases::PathAliases;
pub use data::{
    CoverageData, DataOptions, DataSuffix, ReadView, SCHEMA_VERSION, WarnCallback,
};
pub use numbits::{nums_to_numbits, numbits_to_nums, numbits_union};

pub use common::{Arc, CoverageError, LineNo, Result};
