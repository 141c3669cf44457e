use std::collections::{HashMap, HashSet};

use camino::Utf8PathBuf;
use store::{Arc, CoverageData, DataOptions, LineNo};

pub fn memory_data() -> CoverageData {
    // In-memory stores keep tests fast and side-effect free.
    CoverageData::new(DataOptions {
        no_disk: true,
        ..Default::default()
    })
}

pub fn disk_data(dir: &tempfile::TempDir, name: &str) -> CoverageData {
    CoverageData::new(DataOptions {
        basename: Some(utf8_dir(dir).join(name)),
        ..Default::default()
    })
}

pub fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("temp dir should be utf-8")
}

pub fn lines_map(entries: &[(&str, &[LineNo])]) -> HashMap<String, HashSet<LineNo>> {
    entries
        .iter()
        .map(|(file, lines)| (file.to_string(), lines.iter().copied().collect()))
        .collect()
}

pub fn arcs_map(entries: &[(&str, &[Arc])]) -> HashMap<String, HashSet<Arc>> {
    entries
        .iter()
        .map(|(file, arcs)| (file.to_string(), arcs.iter().copied().collect()))
        .collect()
}

pub fn tracer_map(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(file, tracer)| (file.to_string(), tracer.to_string()))
        .collect()
}
