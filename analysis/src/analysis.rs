//! Per-file coverage analysis: measured data joined against the statement
//! model of the source file.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use common::{Arc, LineNo, Result};
use store::ReadView;

use crate::numbers::Numbers;

/// The source-side model of one file, supplied by the front-end that parses
/// source code. The analysis never looks at source text itself.
pub trait FileReporter {
    /// The path this file is measured under.
    fn filename(&self) -> &str;

    /// The line numbers of the executable statements.
    fn statements(&self) -> BTreeSet<LineNo>;

    /// Lines excluded from consideration by the user.
    fn excluded_lines(&self) -> BTreeSet<LineNo> {
        BTreeSet::new()
    }

    /// Every possible arc in the file.
    fn arcs(&self) -> Vec<Arc> {
        Vec::new()
    }

    /// How many exits each line has.
    fn exit_counts(&self) -> HashMap<LineNo, u32> {
        HashMap::new()
    }

    /// Lines whose partial branches should not be reported.
    fn no_branch_lines(&self) -> BTreeSet<LineNo> {
        BTreeSet::new()
    }

    /// Map raw measured lines back to source lines. Plugins measuring
    /// generated code override this; the default is the identity.
    fn translate_lines(&self, lines: &[LineNo]) -> HashSet<LineNo> {
        lines.iter().copied().collect()
    }

    /// Map raw measured arcs back to source arcs.
    fn translate_arcs(&self, arcs: &[Arc]) -> Vec<Arc> {
        arcs.to_vec()
    }
}

/// The results of analyzing one file.
pub struct Analysis {
    pub filename: String,
    pub statements: BTreeSet<LineNo>,
    pub excluded: BTreeSet<LineNo>,
    pub executed: HashSet<LineNo>,
    pub missing: BTreeSet<LineNo>,
    pub numbers: Numbers,
    has_arcs: bool,
    arc_possibilities: Vec<Arc>,
    arcs_executed: Vec<Arc>,
    exit_counts: HashMap<LineNo, u32>,
    no_branch: BTreeSet<LineNo>,
}

impl Analysis {
    /// Analyze one file: pull its measured lines and arcs out of `data`,
    /// compare them with the reporter's statement model, and precompute the
    /// rolled-up [`Numbers`]. `file_mapper` canonicalizes the measured path
    /// the same way the host tool does everywhere else.
    pub async fn of_file<V, F>(
        data: &mut V,
        precision: usize,
        file_reporter: &dyn FileReporter,
        file_mapper: F,
    ) -> Result<Analysis>
    where
        V: ReadView + ?Sized,
        F: Fn(&str) -> String,
    {
        let filename = file_mapper(file_reporter.filename());
        let statements = file_reporter.statements();
        let excluded = file_reporter.excluded_lines();

        let raw_lines = data.lines(&filename).await?.unwrap_or_default();
        let executed = file_reporter.translate_lines(&raw_lines);
        let missing: BTreeSet<LineNo> = statements
            .iter()
            .filter(|&line| !executed.contains(line))
            .copied()
            .collect();

        let has_arcs = data.has_arcs();
        let (arc_possibilities, arcs_executed, exit_counts, no_branch) = if has_arcs {
            let mut possible = file_reporter.arcs();
            possible.sort_unstable();
            let raw_arcs = data.arcs(&filename).await?.unwrap_or_default();
            let mut executed_arcs = file_reporter.translate_arcs(&raw_arcs);
            executed_arcs.sort_unstable();
            (
                possible,
                executed_arcs,
                file_reporter.exit_counts(),
                file_reporter.no_branch_lines(),
            )
        } else {
            (Vec::new(), Vec::new(), HashMap::new(), BTreeSet::new())
        };

        let mut analysis = Analysis {
            filename,
            statements,
            excluded,
            executed,
            missing,
            numbers: Numbers::with_precision(precision)?,
            has_arcs,
            arc_possibilities,
            arcs_executed,
            exit_counts,
            no_branch,
        };

        let mba = analysis.missing_branch_arcs();
        let n_missing_branches: u64 = mba.values().map(|v| v.len() as u64).sum();
        let n_partial_branches: u64 = mba
            .iter()
            .filter(|&(line, _)| !analysis.missing.contains(line))
            .map(|(_, v)| v.len() as u64)
            .sum();
        analysis.numbers.n_files = 1;
        analysis.numbers.n_statements = analysis.statements.len() as u64;
        analysis.numbers.n_excluded = analysis.excluded.len() as u64;
        analysis.numbers.n_missing = analysis.missing.len() as u64;
        analysis.numbers.n_branches = analysis.total_branches();
        analysis.numbers.n_partial_branches = n_partial_branches;
        analysis.numbers.n_missing_branches = n_missing_branches;
        Ok(analysis)
    }

    /// Were arcs measured in this result?
    pub fn has_arcs(&self) -> bool {
        self.has_arcs
    }

    /// The possible arcs in the file, sorted.
    pub fn arc_possibilities(&self) -> &[Arc] {
        &self.arc_possibilities
    }

    /// The arcs actually executed, sorted.
    pub fn arcs_executed(&self) -> &[Arc] {
        &self.arcs_executed
    }

    /// Possible arcs that never ran. Arcs out of no-branch lines and into
    /// excluded lines are not interesting and are dropped.
    pub fn arcs_missing(&self) -> Vec<Arc> {
        self.arc_possibilities
            .iter()
            .filter(|&pair| {
                self.arcs_executed.binary_search(pair).is_err()
                    && !self.no_branch.contains(&pair.0)
                    && !self.excluded.contains(&pair.1)
            })
            .copied()
            .collect()
    }

    /// Executed arcs that the statement model never predicted.
    ///
    /// Self-loops are dropped, and so are arcs with two negative endpoints:
    /// generators can produce spurious enter-to-exit transitions, so at
    /// least one endpoint must be a real line.
    pub fn arcs_unpredicted(&self) -> Vec<Arc> {
        self.arcs_executed
            .iter()
            .filter(|&pair| {
                self.arc_possibilities.binary_search(pair).is_err()
                    && pair.0 != pair.1
                    && (pair.0 > 0 || pair.1 > 0)
            })
            .copied()
            .collect()
    }

    /// Lines with more than one possible exit.
    fn branch_lines(&self) -> BTreeSet<LineNo> {
        self.exit_counts
            .iter()
            .filter(|&(_, &count)| count > 1)
            .map(|(&line, _)| line)
            .collect()
    }

    fn total_branches(&self) -> u64 {
        self.exit_counts
            .values()
            .filter(|&&count| count > 1)
            .map(|&count| count as u64)
            .sum()
    }

    /// Unexecuted exits, grouped by their branch line.
    pub fn missing_branch_arcs(&self) -> BTreeMap<LineNo, Vec<LineNo>> {
        let branch_lines = self.branch_lines();
        let mut mba: BTreeMap<LineNo, Vec<LineNo>> = BTreeMap::new();
        for (l1, l2) in self.arcs_missing() {
            if branch_lines.contains(&l1) {
                mba.entry(l1).or_default().push(l2);
            }
        }
        mba
    }

    /// Executed exits, grouped by their branch line.
    pub fn executed_branch_arcs(&self) -> BTreeMap<LineNo, Vec<LineNo>> {
        let branch_lines = self.branch_lines();
        let mut eba: BTreeMap<LineNo, Vec<LineNo>> = BTreeMap::new();
        for &(l1, l2) in &self.arcs_executed {
            if branch_lines.contains(&l1) {
                eba.entry(l1).or_default().push(l2);
            }
        }
        eba
    }

    /// Per-branch-line stats: `(total_exits, taken_exits)`.
    pub fn branch_stats(&self) -> BTreeMap<LineNo, (u32, u32)> {
        let missing_arcs = self.missing_branch_arcs();
        let mut stats = BTreeMap::new();
        for line in self.branch_lines() {
            let exits = self.exit_counts.get(&line).copied().unwrap_or_default();
            let missing = missing_arcs.get(&line).map_or(0, |v| v.len() as u32);
            stats.insert(line, (exits, exits.saturating_sub(missing)));
        }
        stats
    }

    /// The missing line numbers, formatted nicely: "1-2, 5-11, 13-14".
    /// With `branches` the missing branch destinations are included too.
    pub fn missing_formatted(&self, branches: bool) -> String {
        let arcs = if branches && self.has_arcs {
            Some(self.missing_branch_arcs())
        } else {
            None
        };
        format_lines(&self.statements, &self.missing, arcs.as_ref())
    }
}

/// Runs of `lines` that are consecutive within `statements`, as inclusive
/// `(start, end)` pairs. Runs coalesce across statement gaps.
fn line_ranges(statements: &BTreeSet<LineNo>, lines: &BTreeSet<LineNo>) -> Vec<(LineNo, LineNo)> {
    let mut pairs = Vec::new();
    let mut start: Option<LineNo> = None;
    let mut end = 0;
    for &stmt in statements {
        if lines.contains(&stmt) {
            if start.is_none() {
                start = Some(stmt);
            }
            end = stmt;
        } else if let Some(s) = start.take() {
            pairs.push((s, end));
        }
    }
    if let Some(s) = start {
        pairs.push((s, end));
    }
    pairs
}

/// Format a set of line numbers for printing, coalescing consecutive
/// statements into ranges: statements `[1,2,3,4,5,10,11,12,13,14]` with
/// lines `[1,2,5,10,11,13,14]` come out as "1-2, 5-11, 13-14".
///
/// `arcs` entries contribute "line->dest" tokens ("exit" for negative
/// destinations), but only when neither endpoint is already reported in
/// `lines`. The result is ordered by the starting line of each token.
pub fn format_lines(
    statements: &BTreeSet<LineNo>,
    lines: &BTreeSet<LineNo>,
    arcs: Option<&BTreeMap<LineNo, Vec<LineNo>>>,
) -> String {
    let mut items: Vec<(LineNo, String)> = line_ranges(statements, lines)
        .into_iter()
        .map(|pair| (pair.0, nice_pair(pair)))
        .collect();
    if let Some(arcs) = arcs {
        for (&line, exits) in arcs {
            let mut exits = exits.clone();
            exits.sort_unstable();
            for ex in exits {
                if !lines.contains(&line) && !lines.contains(&ex) {
                    let dest = if ex > 0 {
                        ex.to_string()
                    } else {
                        "exit".to_string()
                    };
                    items.push((line, format!("{line}->{dest}")));
                }
            }
        }
    }
    items.sort();
    items
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join(", ")
}

fn nice_pair((start, end): (LineNo, LineNo)) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}
