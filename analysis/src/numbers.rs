//! The numerical results of measuring coverage.

use std::iter::Sum;
use std::ops::Add;

use common::{CoverageError, Result};
use serde::Serialize;

/// Basic coverage statistics for one file, or rolled up across files.
///
/// Adding two `Numbers` sums every count; the precision of the left operand
/// wins. Summing an empty sequence gives the zero value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Numbers {
    precision: usize,
    pub n_files: u64,
    pub n_statements: u64,
    pub n_excluded: u64,
    pub n_missing: u64,
    pub n_branches: u64,
    pub n_partial_branches: u64,
    pub n_missing_branches: u64,
}

impl Numbers {
    /// A zero value that will display percentages with `precision` decimal
    /// places. Precision must be below 10.
    pub fn with_precision(precision: usize) -> Result<Self> {
        if precision >= 10 {
            return Err(CoverageError::Config(format!(
                "precision={precision} is invalid. Must be between 0 and 9."
            )));
        }
        Ok(Self {
            precision,
            ..Self::default()
        })
    }

    pub fn precision(&self) -> usize {
        self.precision
    }

    /// The number of executed statements.
    pub fn n_executed(&self) -> u64 {
        self.n_statements - self.n_missing
    }

    /// The number of executed branches.
    pub fn n_executed_branches(&self) -> u64 {
        self.n_branches - self.n_missing_branches
    }

    /// Numerator and denominator of the coverage ratio.
    pub fn ratio_covered(&self) -> (u64, u64) {
        let numerator = self.n_executed() + self.n_executed_branches();
        let denominator = self.n_statements + self.n_branches;
        (numerator, denominator)
    }

    /// The single percentage value for coverage. A file with nothing to
    /// execute counts as fully covered.
    pub fn pc_covered(&self) -> f64 {
        if self.n_statements > 0 {
            let (numerator, denominator) = self.ratio_covered();
            (100.0 * numerator as f64) / denominator as f64
        } else {
            100.0
        }
    }

    /// The percent covered as a display string, without a percent sign.
    pub fn pc_covered_str(&self) -> String {
        self.display_covered(self.pc_covered())
    }

    /// Format a percentage for display at this precision.
    ///
    /// The boundaries are load-bearing: "0" is only shown for a true zero
    /// and "100" only for a true 100. Values inside the first and last
    /// rounding step are pinned to the nearest representable non-boundary
    /// value instead.
    pub fn display_covered(&self, pc: f64) -> String {
        let near0 = 1.0 / 10f64.powi(self.precision as i32);
        let near100 = 100.0 - near0;
        let pc = if 0.0 < pc && pc < near0 {
            near0
        } else if near100 < pc && pc < 100.0 {
            near100
        } else {
            round_to(pc, self.precision)
        };
        format!("{pc:.prec$}", prec = self.precision)
    }

    /// How many characters wide `pc_covered_str` can get.
    pub fn pc_str_width(&self) -> usize {
        let mut width = 3; // "100"
        if self.precision > 0 {
            width += 1 + self.precision;
        }
        width
    }
}

impl Add for Numbers {
    type Output = Numbers;

    fn add(self, other: Numbers) -> Numbers {
        Numbers {
            precision: self.precision,
            n_files: self.n_files + other.n_files,
            n_statements: self.n_statements + other.n_statements,
            n_excluded: self.n_excluded + other.n_excluded,
            n_missing: self.n_missing + other.n_missing,
            n_branches: self.n_branches + other.n_branches,
            n_partial_branches: self.n_partial_branches + other.n_partial_branches,
            n_missing_branches: self.n_missing_branches + other.n_missing_branches,
        }
    }
}

impl Sum for Numbers {
    fn sum<I: Iterator<Item = Numbers>>(iter: I) -> Numbers {
        iter.fold(None, |acc: Option<Numbers>, n| {
            Some(match acc {
                Some(acc) => acc + n,
                None => n,
            })
        })
        .unwrap_or_default()
    }
}

/// Round to `precision` decimal places the way the decimal expansion reads,
/// not the way the nearest binary double falls: two guard digits first, so
/// a value entered as 50.555 lands on 50.56.
pub(crate) fn round_to(value: f64, precision: usize) -> f64 {
    let scale = 10f64.powi(precision as i32);
    ((value * scale * 100.0).round() / 100.0).round() / scale
}

/// Should the measured total fail a minimum-coverage gate?
///
/// `fail_under` outside 0..=100 is a configuration error. A gate of exactly
/// 100 demands a true 100: a rounded-up 99.99 still fails.
pub fn should_fail_under(total: f64, fail_under: f64, precision: usize) -> Result<bool> {
    if !(0.0..=100.0).contains(&fail_under) {
        return Err(CoverageError::Config(format!(
            "fail_under={fail_under} is invalid. Must be between 0 and 100."
        )));
    }
    if fail_under == 100.0 && total != 100.0 {
        return Ok(true);
    }
    Ok(round_to(total, precision) < fail_under)
}
