//! Turning measured coverage data into per-file statistics.
//!
//! [`Analysis`] joins what the data file says ran against what the source
//! model says could run; [`Numbers`] carries the resulting counts and knows
//! how to display percentages without lying at the boundaries.

mod analysis;
mod numbers;

pub use analysis::{Analysis, FileReporter, format_lines};
pub use numbers::{Numbers, should_fail_under};

pub use common::{Arc, CoverageError, LineNo, Result};
