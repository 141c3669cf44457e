//! The coverage data file: ingestion, querying, merging, serialization.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::io::{Read as _, Write as _};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use common::{Arc, CoverageError, LineNo, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rand::Rng as _;
use regex::Regex;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::{Executor, Row as _, Sqlite};

use crate::aliases::PathAliases;
use crate::numbits::{nums_to_numbits, numbits_to_nums, numbits_union};
use crate::sqlite::SqliteDb;

/// Bumped whenever the table layout changes; a data file written with a
/// different version is refused outright.
pub const SCHEMA_VERSION: i64 = 7;

const SCHEMA: &str = "\
CREATE TABLE coverage_schema (
    -- One row, the version of the schema in this db.
    version integer
);

CREATE TABLE meta (
    -- Key-value metadata about the data file.
    -- Keys: 'has_arcs', 'sys_argv', 'version', 'when'.
    key text,
    value text,
    unique (key)
);

CREATE TABLE file (
    -- A row per file measured.
    id integer primary key,
    path text,
    unique (path)
);

CREATE TABLE context (
    -- A row per context measured.
    id integer primary key,
    context text,
    unique (context)
);

CREATE TABLE line_bits (
    -- If recording lines, a row per context per file executed. All the
    -- line numbers for that file/context are in one numbits blob.
    file_id integer,
    context_id integer,
    numbits blob,
    foreign key (file_id) references file (id),
    foreign key (context_id) references context (id),
    unique (file_id, context_id)
);

CREATE TABLE arc (
    -- If recording branches, a row per context per from/to transition.
    file_id integer,
    context_id integer,
    fromno integer,
    tono integer,
    foreign key (file_id) references file (id),
    foreign key (context_id) references context (id),
    unique (file_id, context_id, fromno, tono)
);

CREATE TABLE tracer (
    -- A row per file naming the tracer plugin that measured it.
    file_id integer primary key,
    tracer text,
    foreign key (file_id) references file (id)
);
";

/// How the on-disk filename is suffixed for parallel measurement.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DataSuffix {
    /// Write to the base filename.
    #[default]
    None,
    /// Append `<hostname>.<pid>.<6-hex-random>` so concurrent processes
    /// never collide.
    Auto,
    /// Append a caller-chosen suffix.
    Literal(String),
}

/// A non-fatal warning sink supplied by the host tool.
pub type WarnCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Construction parameters for [`CoverageData`].
pub struct DataOptions {
    /// Base name of the data file; defaults to `.coverage`.
    pub basename: Option<Utf8PathBuf>,
    pub suffix: DataSuffix,
    /// Keep everything in memory and never touch the disk.
    pub no_disk: bool,
    pub warn: Option<WarnCallback>,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            basename: None,
            suffix: DataSuffix::None,
            no_disk: false,
            warn: None,
        }
    }
}

/// Manages collected coverage data, including its file storage.
///
/// A data file records either executed lines or executed arcs, never both;
/// the first ingestion fixes the mode for the file's lifetime. Lines, arcs,
/// and tracer names are stored per source file, partitioned by context.
/// Paths are case-sensitive even on case-insensitive filesystems.
///
/// To adopt an existing file call [`read`](Self::read) before querying: a
/// fresh object erases stale data on its first use otherwise, which is what
/// measurement runs want. Two collections are combined with
/// [`update`](Self::update); [`dumps`](Self::dumps) and
/// [`loads`](Self::loads) move whole data sets as byte strings.
pub struct CoverageData {
    no_disk: bool,
    basename: Utf8PathBuf,
    suffix: DataSuffix,
    filename: Utf8PathBuf,
    warn: Option<WarnCallback>,

    db: Option<SqliteDb>,
    pid: u32,

    // Whether this object is in sync with the on-disk file.
    have_used: bool,

    has_lines: bool,
    has_arcs: bool,

    file_map: HashMap<String, i64>,
    current_context: Option<String>,
    current_context_id: Option<i64>,
    query_context_ids: Option<Vec<i64>>,
}

impl CoverageData {
    pub fn new(options: DataOptions) -> Self {
        let basename = absolutize(
            options
                .basename
                .unwrap_or_else(|| Utf8PathBuf::from(".coverage")),
        );
        let mut data = Self {
            no_disk: options.no_disk,
            basename,
            suffix: options.suffix,
            filename: Utf8PathBuf::new(),
            warn: options.warn,
            db: None,
            pid: std::process::id(),
            have_used: false,
            has_lines: false,
            has_arcs: false,
            file_map: HashMap::new(),
            current_context: None,
            current_context_id: None,
            query_context_ids: None,
        };
        data.choose_filename();
        data
    }

    /// The base filename for storing data.
    pub fn base_filename(&self) -> &Utf8Path {
        &self.basename
    }

    /// Where the data is actually stored, suffix included.
    pub fn data_filename(&self) -> &Utf8Path {
        &self.filename
    }

    /// Start using an existing data file, without erasing it first.
    pub async fn read(&mut self) -> Result<()> {
        self.connect().await?;
        self.have_used = true;
        Ok(())
    }

    /// Whether any file has been measured. Missing or unreadable data files
    /// count as "no data".
    pub async fn has_data(&mut self) -> bool {
        if self.db.is_none() && !self.filename.as_std_path().exists() {
            return false;
        }
        let Ok(pool) = self.connect().await else {
            return false;
        };
        match sqlx::query("select id from file limit 1")
            .fetch_all(&pool)
            .await
        {
            Ok(rows) => !rows.is_empty(),
            Err(_) => false,
        }
    }

    /// Does the data file record arcs (true) or lines (false)?
    pub fn has_arcs(&self) -> bool {
        self.has_arcs
    }

    /// All files that have been measured.
    pub fn measured_files(&self) -> HashSet<String> {
        self.file_map.keys().cloned().collect()
    }

    /// All context names that have been measured.
    pub async fn measured_contexts(&mut self) -> Result<HashSet<String>> {
        self.start_using().await?;
        let pool = self.connect().await?;
        let rows = sqlx::query("select distinct(context) from context")
            .fetch_all(&pool)
            .await
            .map_err(|e| self.db_err(e))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Set the context recorded with subsequent [`add_lines`](Self::add_lines)
    /// and [`add_arcs`](Self::add_arcs) calls. `None` and `Some("")` both
    /// mean the default context.
    pub fn set_context(&mut self, context: Option<&str>) {
        log::debug!("Setting context: {context:?}");
        self.current_context = context.map(str::to_string);
        self.current_context_id = None;
    }

    /// Add measured line data: a map from filename to executed line numbers.
    pub async fn add_lines(&mut self, line_data: &HashMap<String, HashSet<LineNo>>) -> Result<()> {
        log::debug!(
            "Adding lines: {} files, {} lines total",
            line_data.len(),
            line_data.values().map(HashSet::len).sum::<usize>()
        );
        self.start_using().await?;
        self.choose_lines_or_arcs(false).await?;
        if line_data.is_empty() {
            return Ok(());
        }
        let pool = self.connect().await?;
        let mut tx = pool.begin().await.map_err(|e| self.db_err(e))?;
        let context_id = self.context_id_for_write(&mut tx).await?;
        for (filename, linenos) in line_data {
            let file_id = self.intern_file(&mut tx, filename).await?;
            let mut numbits = nums_to_numbits(linenos.iter().copied());
            let existing =
                sqlx::query("select numbits from line_bits where file_id = ? and context_id = ?")
                    .bind(file_id)
                    .bind(context_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| self.db_err(e))?;
            if let Some(row) = existing {
                numbits = numbits_union(&numbits, &row.get::<Vec<u8>, _>(0));
            }
            sqlx::query(
                "insert or replace into line_bits (file_id, context_id, numbits) \
                 values (?, ?, ?)",
            )
            .bind(file_id)
            .bind(context_id)
            .bind(numbits)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.db_err(e))?;
        }
        tx.commit().await.map_err(|e| self.db_err(e))?;
        Ok(())
    }

    /// Add measured arc data: a map from filename to executed transitions.
    pub async fn add_arcs(&mut self, arc_data: &HashMap<String, HashSet<Arc>>) -> Result<()> {
        log::debug!(
            "Adding arcs: {} files, {} arcs total",
            arc_data.len(),
            arc_data.values().map(HashSet::len).sum::<usize>()
        );
        self.start_using().await?;
        self.choose_lines_or_arcs(true).await?;
        if arc_data.is_empty() {
            return Ok(());
        }
        let pool = self.connect().await?;
        let mut tx = pool.begin().await.map_err(|e| self.db_err(e))?;
        let context_id = self.context_id_for_write(&mut tx).await?;
        for (filename, arcs) in arc_data {
            let file_id = self.intern_file(&mut tx, filename).await?;
            for &(fromno, tono) in arcs {
                sqlx::query(
                    "insert or ignore into arc (file_id, context_id, fromno, tono) \
                     values (?, ?, ?, ?)",
                )
                .bind(file_id)
                .bind(context_id)
                .bind(fromno)
                .bind(tono)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?;
            }
        }
        tx.commit().await.map_err(|e| self.db_err(e))?;
        Ok(())
    }

    /// Record which tracer plugin measured each file. A second registration
    /// with a different non-empty name is an error; an empty name is a no-op.
    pub async fn add_file_tracers(&mut self, file_tracers: &HashMap<String, String>) -> Result<()> {
        log::debug!("Adding file tracers: {} files", file_tracers.len());
        if file_tracers.is_empty() {
            return Ok(());
        }
        self.start_using().await?;
        let pool = self.connect().await?;
        let mut tx = pool.begin().await.map_err(|e| self.db_err(e))?;
        for (filename, plugin_name) in file_tracers {
            let Some(&file_id) = self.file_map.get(filename) else {
                return Err(CoverageError::Data(format!(
                    "Can't add file tracer data for unmeasured file '{filename}'"
                )));
            };
            let existing = sqlx::query("select tracer from tracer where file_id = ?")
                .bind(file_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?
                .and_then(|row| row.get::<Option<String>, _>(0));
            match existing {
                Some(existing) if !existing.is_empty() => {
                    if existing != *plugin_name {
                        return Err(CoverageError::Data(format!(
                            "Conflicting file tracer name for '{filename}': \
                             '{existing}' vs '{plugin_name}'"
                        )));
                    }
                }
                _ => {
                    if !plugin_name.is_empty() {
                        sqlx::query("insert into tracer (file_id, tracer) values (?, ?)")
                            .bind(file_id)
                            .bind(plugin_name)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| self.db_err(e))?;
                    }
                }
            }
        }
        tx.commit().await.map_err(|e| self.db_err(e))?;
        Ok(())
    }

    /// Ensure `filename` appears in the data, empty if needed. Requires the
    /// lines/arcs mode to have been chosen already.
    pub async fn touch_file(&mut self, filename: &str, plugin_name: &str) -> Result<()> {
        log::debug!("Touching {filename:?}");
        self.start_using().await?;
        if !self.has_arcs && !self.has_lines {
            return Err(CoverageError::Data(
                "Can't touch files in an empty CoverageData".to_string(),
            ));
        }
        let pool = self.connect().await?;
        {
            let mut conn = pool.acquire().await.map_err(|e| self.db_err(e))?;
            self.intern_file(&mut conn, filename).await?;
        }
        if !plugin_name.is_empty() {
            let tracers = HashMap::from([(filename.to_string(), plugin_name.to_string())]);
            self.add_file_tracers(&tracers).await?;
        }
        Ok(())
    }

    /// Limit subsequent queries to a single context, matched exactly.
    /// An unknown name is not an error; queries just come back empty.
    pub async fn set_query_context(&mut self, context: &str) -> Result<()> {
        self.start_using().await?;
        let pool = self.connect().await?;
        let rows = sqlx::query("select id from context where context = ?")
            .bind(context)
            .fetch_all(&pool)
            .await
            .map_err(|e| self.db_err(e))?;
        self.query_context_ids = Some(rows.iter().map(|row| row.get(0)).collect());
        Ok(())
    }

    /// Limit subsequent queries to contexts matching any of `patterns`,
    /// regex substring search. An empty slice clears the filter.
    pub async fn set_query_contexts(&mut self, patterns: &[String]) -> Result<()> {
        self.start_using().await?;
        if patterns.is_empty() {
            self.query_context_ids = None;
            return Ok(());
        }
        let mut regexes = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            regexes.push(Regex::new(pattern).map_err(|e| {
                CoverageError::Data(format!("Invalid context pattern '{pattern}': {e}"))
            })?);
        }
        let pool = self.connect().await?;
        let rows = sqlx::query("select id, context from context")
            .fetch_all(&pool)
            .await
            .map_err(|e| self.db_err(e))?;
        let ids = rows
            .iter()
            .filter(|row| {
                let context: String = row.get(1);
                regexes.iter().any(|rx| rx.is_match(&context))
            })
            .map(|row| row.get::<i64, _>(0))
            .collect();
        self.query_context_ids = Some(ids);
        Ok(())
    }

    /// The executed line numbers for a file, ascending, or `None` if the
    /// file was never measured. In arcs mode the lines are the positive
    /// endpoints of the executed arcs.
    pub async fn lines(&mut self, filename: &str) -> Result<Option<Vec<LineNo>>> {
        self.start_using().await?;
        if self.has_arcs {
            return Ok(self.arcs(filename).await?.map(|arcs| {
                let mut lines = BTreeSet::new();
                for (fromno, tono) in arcs {
                    if fromno > 0 {
                        lines.insert(fromno);
                    }
                    if tono > 0 {
                        lines.insert(tono);
                    }
                }
                lines.into_iter().collect()
            }));
        }
        let pool = self.connect().await?;
        let Some(&file_id) = self.file_map.get(filename) else {
            return Ok(None);
        };
        let mut query = String::from("select numbits from line_bits where file_id = ?");
        push_context_filter(&mut query, "context_id", self.query_context_ids.as_deref());
        let mut q = sqlx::query(&query).bind(file_id);
        if let Some(ids) = &self.query_context_ids {
            for &id in ids {
                q = q.bind(id);
            }
        }
        let rows = q.fetch_all(&pool).await.map_err(|e| self.db_err(e))?;
        let mut nums = BTreeSet::new();
        for row in &rows {
            nums.extend(numbits_to_nums(&row.get::<Vec<u8>, _>(0)));
        }
        Ok(Some(nums.into_iter().collect()))
    }

    /// The distinct executed arcs for a file, ascending, or `None` if the
    /// file was never measured.
    pub async fn arcs(&mut self, filename: &str) -> Result<Option<Vec<Arc>>> {
        self.start_using().await?;
        let pool = self.connect().await?;
        let Some(&file_id) = self.file_map.get(filename) else {
            return Ok(None);
        };
        let mut query = String::from("select distinct fromno, tono from arc where file_id = ?");
        push_context_filter(&mut query, "context_id", self.query_context_ids.as_deref());
        let mut q = sqlx::query(&query).bind(file_id);
        if let Some(ids) = &self.query_context_ids {
            for &id in ids {
                q = q.bind(id);
            }
        }
        let rows = q.fetch_all(&pool).await.map_err(|e| self.db_err(e))?;
        let mut arcs: Vec<Arc> = rows
            .iter()
            .map(|row| (row.get::<i64, _>(0), row.get::<i64, _>(1)))
            .collect();
        arcs.sort_unstable();
        Ok(Some(arcs))
    }

    /// The contexts that executed each line of a file. In arcs mode both
    /// endpoints of an arc get the arc's context.
    pub async fn contexts_by_lineno(
        &mut self,
        filename: &str,
    ) -> Result<BTreeMap<LineNo, Vec<String>>> {
        self.start_using().await?;
        let mut map: BTreeMap<LineNo, Vec<String>> = BTreeMap::new();
        let pool = self.connect().await?;
        let Some(&file_id) = self.file_map.get(filename) else {
            return Ok(map);
        };
        if self.has_arcs {
            let mut query = String::from(
                "select arc.fromno, arc.tono, context.context \
                 from arc, context \
                 where arc.file_id = ? and arc.context_id = context.id",
            );
            push_context_filter(&mut query, "arc.context_id", self.query_context_ids.as_deref());
            let mut q = sqlx::query(&query).bind(file_id);
            if let Some(ids) = &self.query_context_ids {
                for &id in ids {
                    q = q.bind(id);
                }
            }
            let rows = q.fetch_all(&pool).await.map_err(|e| self.db_err(e))?;
            for row in &rows {
                let context: String = row.get(2);
                for lineno in [row.get::<i64, _>(0), row.get::<i64, _>(1)] {
                    let contexts = map.entry(lineno).or_default();
                    if !contexts.contains(&context) {
                        contexts.push(context.clone());
                    }
                }
            }
        } else {
            let mut query = String::from(
                "select l.numbits, c.context from line_bits l, context c \
                 where l.context_id = c.id and file_id = ?",
            );
            push_context_filter(&mut query, "l.context_id", self.query_context_ids.as_deref());
            let mut q = sqlx::query(&query).bind(file_id);
            if let Some(ids) = &self.query_context_ids {
                for &id in ids {
                    q = q.bind(id);
                }
            }
            let rows = q.fetch_all(&pool).await.map_err(|e| self.db_err(e))?;
            for row in &rows {
                let context: String = row.get(1);
                for lineno in numbits_to_nums(&row.get::<Vec<u8>, _>(0)) {
                    map.entry(lineno).or_default().push(context.clone());
                }
            }
        }
        Ok(map)
    }

    /// The tracer plugin name for a file: `None` if the file is unknown,
    /// `Some("")` if it was measured without a plugin.
    pub async fn file_tracer(&mut self, filename: &str) -> Result<Option<String>> {
        self.start_using().await?;
        let pool = self.connect().await?;
        let Some(&file_id) = self.file_map.get(filename) else {
            return Ok(None);
        };
        let row = sqlx::query("select tracer from tracer where file_id = ?")
            .bind(file_id)
            .fetch_optional(&pool)
            .await
            .map_err(|e| self.db_err(e))?;
        Ok(Some(
            row.and_then(|row| row.get::<Option<String>, _>(0))
                .unwrap_or_default(),
        ))
    }

    /// Erase the data: close the handle, discard in-memory state, delete
    /// the data file. With `parallel` also deletes sibling files written by
    /// parallel-mode suffixes.
    pub async fn erase(&mut self, parallel: bool) -> Result<()> {
        self.reset().await;
        if self.no_disk {
            return Ok(());
        }
        log::debug!("Erasing data file {:?}", self.filename);
        file_be_gone(&self.filename)?;
        if parallel {
            let dir = self
                .filename
                .parent()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|| Utf8PathBuf::from("."));
            let Some(local) = self.filename.file_name() else {
                return Ok(());
            };
            let prefix = format!("{local}.");
            let Ok(entries) = std::fs::read_dir(dir.as_std_path()) else {
                return Ok(());
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !name.starts_with(&prefix) {
                    continue;
                }
                log::debug!("Erasing parallel data file {name:?}");
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    self.warn(&format!("Couldn't erase parallel data file '{name}': {e}"));
                }
            }
        }
        Ok(())
    }

    /// Serialize the data to a byte string: the letter `z` followed by a
    /// zlib-compressed SQL dump. Only [`loads`](Self::loads) understands the
    /// format.
    pub async fn dumps(&mut self) -> Result<Vec<u8>> {
        log::debug!("Dumping data from data file {:?}", self.filename);
        let pool = self.connect().await?;
        let script = self.dump_sql(&pool).await?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        let written = encoder.write_all(script.as_bytes());
        let compressed = written
            .and_then(|()| encoder.finish())
            .map_err(|e| CoverageError::Data(format!("Couldn't serialize data: {e}")))?;
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(b'z');
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Deserialize data produced by [`dumps`](Self::dumps) into this
    /// newly-created object, replacing its contents.
    pub async fn loads(&mut self, data: &[u8]) -> Result<()> {
        log::debug!("Loading data into data file {:?}", self.filename);
        if data.first() != Some(&b'z') {
            return Err(CoverageError::UnrecognizedSerialization {
                head: data.iter().take(40).copied().collect(),
                len: data.len(),
            });
        }
        let mut script = String::new();
        ZlibDecoder::new(&data[1..])
            .read_to_string(&mut script)
            .map_err(|e| CoverageError::Data(format!("Couldn't deserialize data: {e}")))?;
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        let db = SqliteDb::open(&self.filename, self.no_disk).await?;
        db.execute_script(&script).await?;
        let pool = db.pool().clone();
        self.db = Some(db);
        self.read_metadata(&pool).await?;
        self.have_used = true;
        Ok(())
    }

    /// Merge another data collection into this one. `aliases` re-homes
    /// paths recorded on a different machine. The stores must agree on
    /// lines/arcs mode unless one of them is empty.
    pub async fn update(
        &mut self,
        other: &mut CoverageData,
        aliases: Option<&PathAliases>,
    ) -> Result<()> {
        log::debug!("Updating with data from {:?}", other.filename);
        other.read().await?;
        if self.has_lines && other.has_arcs {
            return Err(CoverageError::Data(
                "Can't combine arc data with line data".to_string(),
            ));
        }
        if self.has_arcs && other.has_lines {
            return Err(CoverageError::Data(
                "Can't combine line data with arc data".to_string(),
            ));
        }
        let default_aliases = PathAliases::new();
        let aliases = aliases.unwrap_or(&default_aliases);

        // Make sure our own file exists before we start writing into it.
        self.start_using().await?;

        // Pull everything out of the other store, paths re-homed.
        let other_pool = other.connect().await?;
        let mut files: HashMap<String, String> = HashMap::new();
        for row in sqlx::query("select path from file")
            .fetch_all(&other_pool)
            .await
            .map_err(|e| other.db_err(e))?
        {
            let path: String = row.get(0);
            let mapped = aliases.map(&path);
            files.insert(path, mapped);
        }
        let contexts: Vec<String> = sqlx::query("select context from context")
            .fetch_all(&other_pool)
            .await
            .map_err(|e| other.db_err(e))?
            .iter()
            .map(|row| row.get(0))
            .collect();
        let mut arcs: Vec<(String, String, LineNo, LineNo)> = Vec::new();
        for row in sqlx::query(
            "select file.path, context.context, arc.fromno, arc.tono \
             from arc \
             inner join file on file.id = arc.file_id \
             inner join context on context.id = arc.context_id",
        )
        .fetch_all(&other_pool)
        .await
        .map_err(|e| other.db_err(e))?
        {
            let path: String = row.get(0);
            let mapped = files.get(&path).cloned().unwrap_or(path);
            arcs.push((mapped, row.get(1), row.get(2), row.get(3)));
        }
        let mut lines: HashMap<(String, String), Vec<u8>> = HashMap::new();
        for row in sqlx::query(
            "select file.path, context.context, line_bits.numbits \
             from line_bits \
             inner join file on file.id = line_bits.file_id \
             inner join context on context.id = line_bits.context_id",
        )
        .fetch_all(&other_pool)
        .await
        .map_err(|e| other.db_err(e))?
        {
            let path: String = row.get(0);
            let mapped = files.get(&path).cloned().unwrap_or(path);
            lines.insert((mapped, row.get(1)), row.get(2));
        }
        let mut tracers: HashMap<String, String> = HashMap::new();
        for row in sqlx::query(
            "select file.path, tracer \
             from tracer \
             inner join file on file.id = tracer.file_id",
        )
        .fetch_all(&other_pool)
        .await
        .map_err(|e| other.db_err(e))?
        {
            let path: String = row.get(0);
            let mapped = files.get(&path).cloned().unwrap_or(path);
            tracers.insert(mapped, row.get::<Option<String>, _>(1).unwrap_or_default());
        }

        let pool = self.connect().await?;
        let mut tx = pool.begin().await.map_err(|e| self.db_err(e))?;

        // Every file measured here has at least the "" tracer.
        let mut this_tracers: HashMap<String, String> = HashMap::new();
        for row in sqlx::query("select path from file")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| self.db_err(e))?
        {
            this_tracers.insert(row.get(0), String::new());
        }
        for row in sqlx::query(
            "select file.path, tracer from tracer \
             inner join file on file.id = tracer.file_id",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| self.db_err(e))?
        {
            let path: String = row.get(0);
            this_tracers.insert(
                aliases.map(&path),
                row.get::<Option<String>, _>(1).unwrap_or_default(),
            );
        }

        // Create all file and context rows, then reload the id maps.
        for path in files.values() {
            sqlx::query("insert or ignore into file (path) values (?)")
                .bind(path)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?;
        }
        let mut file_ids: HashMap<String, i64> = HashMap::new();
        for row in sqlx::query("select id, path from file")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| self.db_err(e))?
        {
            file_ids.insert(row.get(1), row.get(0));
        }
        for context in &contexts {
            sqlx::query("insert or ignore into context (context) values (?)")
                .bind(context)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?;
        }
        let mut context_ids: HashMap<String, i64> = HashMap::new();
        for row in sqlx::query("select id, context from context")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| self.db_err(e))?
        {
            context_ids.insert(row.get(1), row.get(0));
        }

        // A tracer disagreement fails the whole merge.
        let mut tracer_map: HashMap<String, String> = HashMap::new();
        for path in files.values() {
            let this_tracer = this_tracers.get(path);
            let other_tracer = tracers.get(path).cloned().unwrap_or_default();
            if let Some(this_tracer) = this_tracer {
                if !this_tracer.is_empty()
                    && !other_tracer.is_empty()
                    && *this_tracer != other_tracer
                {
                    return Err(CoverageError::Data(format!(
                        "Conflicting file tracer name for '{path}': \
                         '{this_tracer}' vs '{other_tracer}'"
                    )));
                }
            }
            tracer_map.insert(path.clone(), other_tracer);
        }

        // Fold our own bitmaps into the incoming ones so the rewrite below
        // is a union, not a replacement.
        for row in sqlx::query(
            "select file.path, context.context, line_bits.numbits \
             from line_bits \
             inner join file on file.id = line_bits.file_id \
             inner join context on context.id = line_bits.context_id",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| self.db_err(e))?
        {
            let path: String = row.get(0);
            let key = (aliases.map(&path), row.get::<String, _>(1));
            let numbits: Vec<u8> = row.get(2);
            let entry = lines.entry(key).or_default();
            *entry = numbits_union(entry, &numbits);
        }

        if !arcs.is_empty() {
            if self.check_mode_choice(true)? {
                self.record_mode(&mut *tx, true).await?;
            }
            for (path, context, fromno, tono) in &arcs {
                let (Some(&file_id), Some(&context_id)) =
                    (file_ids.get(path), context_ids.get(context))
                else {
                    continue;
                };
                sqlx::query(
                    "insert or ignore into arc (file_id, context_id, fromno, tono) \
                     values (?, ?, ?, ?)",
                )
                .bind(file_id)
                .bind(context_id)
                .bind(fromno)
                .bind(tono)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?;
            }
        }

        if !lines.is_empty() {
            if self.check_mode_choice(false)? {
                self.record_mode(&mut *tx, false).await?;
            }
            sqlx::query("delete from line_bits")
                .execute(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?;
            for ((path, context), numbits) in &lines {
                let (Some(&file_id), Some(&context_id)) =
                    (file_ids.get(path), context_ids.get(context))
                else {
                    continue;
                };
                sqlx::query(
                    "insert into line_bits (file_id, context_id, numbits) values (?, ?, ?)",
                )
                .bind(file_id)
                .bind(context_id)
                .bind(numbits.clone())
                .execute(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?;
            }
        }

        for (path, tracer) in &tracer_map {
            let Some(&file_id) = file_ids.get(path) else {
                continue;
            };
            sqlx::query("insert or ignore into tracer (file_id, tracer) values (?, ?)")
                .bind(file_id)
                .bind(tracer)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.db_err(e))?;
        }

        tx.commit().await.map_err(|e| self.db_err(e))?;

        // The caches are stale now.
        if self.no_disk {
            let pool = self.connect().await?;
            self.read_metadata(&pool).await?;
        } else {
            self.reset().await;
            self.read().await?;
        }
        Ok(())
    }

    fn warn(&self, message: &str) {
        if let Some(warn) = &self.warn {
            warn(message);
        }
    }

    fn db_err(&self, e: sqlx::Error) -> CoverageError {
        CoverageError::data_file(&self.filename, &e)
    }

    fn choose_filename(&mut self) {
        if self.no_disk {
            self.filename = Utf8PathBuf::from(":memory:");
        } else {
            match filename_suffix(&self.suffix) {
                Some(suffix) => {
                    self.filename = Utf8PathBuf::from(format!("{}.{suffix}", self.basename));
                }
                None => self.filename = self.basename.clone(),
            }
        }
    }

    /// Drop the handle and every in-memory cache. The lines/arcs mode is
    /// deliberately kept: it describes what this object records, not what
    /// the file currently holds.
    async fn reset(&mut self) {
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        self.file_map.clear();
        self.have_used = false;
        self.current_context_id = None;
    }

    /// Every entry point funnels through here: detect a fork, and erase
    /// stale data the first time a fresh object touches its file.
    async fn start_using(&mut self) -> Result<()> {
        if self.pid != std::process::id() {
            // We forked: this child needs its own data file and handle.
            self.reset().await;
            self.choose_filename();
            self.pid = std::process::id();
        }
        if !self.have_used {
            self.erase(false).await?;
        }
        self.have_used = true;
        Ok(())
    }

    async fn connect(&mut self) -> Result<SqlitePool> {
        if let Some(db) = &self.db {
            return Ok(db.pool().clone());
        }
        if !self.no_disk && self.filename.as_std_path().exists() {
            self.open_db().await
        } else {
            self.create_db().await
        }
    }

    /// Create a data file that doesn't exist yet: schema plus creation
    /// metadata.
    async fn create_db(&mut self) -> Result<SqlitePool> {
        log::debug!("Creating data file {:?}", self.filename);
        let db = SqliteDb::open(&self.filename, self.no_disk).await?;
        db.execute_script(SCHEMA).await?;
        let pool = db.pool().clone();
        sqlx::query("insert into coverage_schema (version) values (?)")
            .bind(SCHEMA_VERSION)
            .execute(&pool)
            .await
            .map_err(|e| self.db_err(e))?;
        let argv: Vec<String> = std::env::args().collect();
        let meta = [
            ("sys_argv", format!("{argv:?}")),
            ("version", env!("CARGO_PKG_VERSION").to_string()),
            (
                "when",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
        ];
        for (key, value) in meta {
            sqlx::query("insert into meta (key, value) values (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&pool)
                .await
                .map_err(|e| self.db_err(e))?;
        }
        self.db = Some(db);
        Ok(pool)
    }

    /// Open an existing data file and read its metadata.
    async fn open_db(&mut self) -> Result<SqlitePool> {
        log::debug!("Opening data file {:?}", self.filename);
        let db = SqliteDb::open(&self.filename, false).await?;
        let pool = db.pool().clone();
        self.db = Some(db);
        self.read_metadata(&pool).await?;
        Ok(pool)
    }

    /// Read the schema version, the mode flag, and the file-id map.
    async fn read_metadata(&mut self, pool: &SqlitePool) -> Result<()> {
        let row = sqlx::query("select version from coverage_schema")
            .fetch_one(pool)
            .await
            .map_err(|e| {
                CoverageError::Data(format!(
                    "Data file '{}' doesn't seem to be a coverage data file: {e}",
                    self.filename
                ))
            })?;
        let schema_version: i64 = row.get(0);
        if schema_version != SCHEMA_VERSION {
            return Err(CoverageError::Data(format!(
                "Couldn't use data file '{}': wrong schema: {schema_version} \
                 instead of {SCHEMA_VERSION}",
                self.filename
            )));
        }

        if let Some(row) = sqlx::query("select value from meta where key = 'has_arcs'")
            .fetch_optional(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            let value: String = row.get(0);
            self.has_arcs = value != "0";
            self.has_lines = !self.has_arcs;
        }

        self.file_map.clear();
        for row in sqlx::query("select path, id from file")
            .fetch_all(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            self.file_map.insert(row.get(0), row.get(1));
        }
        Ok(())
    }

    /// Validate an ingestion against the store's fixed mode. `Ok(true)`
    /// means the mode is still unchosen and this call gets to fix it.
    fn check_mode_choice(&self, arcs: bool) -> Result<bool> {
        if !arcs && self.has_arcs {
            return Err(CoverageError::Data(
                "Can't add lines to existing arc data".to_string(),
            ));
        }
        if arcs && self.has_lines {
            return Err(CoverageError::Data(
                "Can't add arcs to existing line data".to_string(),
            ));
        }
        Ok(!self.has_arcs && !self.has_lines)
    }

    /// Fix the lines/arcs mode, in memory and in the meta table.
    async fn record_mode<'e, E>(&mut self, executor: E, arcs: bool) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        self.has_lines = !arcs;
        self.has_arcs = arcs;
        sqlx::query("insert into meta (key, value) values (?, ?)")
            .bind("has_arcs")
            .bind(if arcs { "1" } else { "0" })
            .execute(executor)
            .await
            .map_err(|e| self.db_err(e))?;
        Ok(())
    }

    /// Force the data file to choose between lines and arcs.
    async fn choose_lines_or_arcs(&mut self, arcs: bool) -> Result<()> {
        if self.check_mode_choice(arcs)? {
            let pool = self.connect().await?;
            self.record_mode(&pool, arcs).await?;
        }
        Ok(())
    }

    /// The id for a file path, inserting the row on first reference.
    async fn intern_file(&mut self, conn: &mut SqliteConnection, filename: &str) -> Result<i64> {
        if let Some(&id) = self.file_map.get(filename) {
            return Ok(id);
        }
        let result = sqlx::query("insert or replace into file (path) values (?)")
            .bind(filename)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.db_err(e))?;
        let id = result.last_insert_rowid();
        self.file_map.insert(filename.to_string(), id);
        Ok(id)
    }

    /// The id of the current ingestion context, creating its row lazily.
    async fn context_id_for_write(&mut self, conn: &mut SqliteConnection) -> Result<i64> {
        if let Some(id) = self.current_context_id {
            return Ok(id);
        }
        let context = self.current_context.clone().unwrap_or_default();
        let row = sqlx::query("select id from context where context = ?")
            .bind(&context)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| self.db_err(e))?;
        let id = match row {
            Some(row) => row.get(0),
            None => sqlx::query("insert into context (context) values (?)")
                .bind(&context)
                .execute(&mut *conn)
                .await
                .map_err(|e| self.db_err(e))?
                .last_insert_rowid(),
        };
        self.current_context_id = Some(id);
        Ok(id)
    }

    /// A SQL script reproducing the whole database: the schema plus one
    /// INSERT per row, wrapped in a transaction.
    async fn dump_sql(&self, pool: &SqlitePool) -> Result<String> {
        let mut script = String::from("BEGIN TRANSACTION;\n");
        script.push_str(SCHEMA);

        for row in sqlx::query("select version from coverage_schema")
            .fetch_all(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            let _ = writeln!(
                script,
                "INSERT INTO coverage_schema (version) VALUES ({});",
                row.get::<i64, _>(0)
            );
        }
        for row in sqlx::query("select key, value from meta order by key")
            .fetch_all(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            let _ = writeln!(
                script,
                "INSERT INTO meta (key, value) VALUES ({}, {});",
                sql_text(&row.get::<String, _>(0)),
                sql_text(&row.get::<String, _>(1)),
            );
        }
        for row in sqlx::query("select id, path from file order by id")
            .fetch_all(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            let _ = writeln!(
                script,
                "INSERT INTO file (id, path) VALUES ({}, {});",
                row.get::<i64, _>(0),
                sql_text(&row.get::<String, _>(1)),
            );
        }
        for row in sqlx::query("select id, context from context order by id")
            .fetch_all(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            let _ = writeln!(
                script,
                "INSERT INTO context (id, context) VALUES ({}, {});",
                row.get::<i64, _>(0),
                sql_text(&row.get::<String, _>(1)),
            );
        }
        for row in sqlx::query("select file_id, context_id, numbits from line_bits")
            .fetch_all(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            let _ = writeln!(
                script,
                "INSERT INTO line_bits (file_id, context_id, numbits) VALUES ({}, {}, {});",
                row.get::<i64, _>(0),
                row.get::<i64, _>(1),
                sql_blob(&row.get::<Vec<u8>, _>(2)),
            );
        }
        for row in sqlx::query("select file_id, context_id, fromno, tono from arc")
            .fetch_all(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            let _ = writeln!(
                script,
                "INSERT INTO arc (file_id, context_id, fromno, tono) VALUES ({}, {}, {}, {});",
                row.get::<i64, _>(0),
                row.get::<i64, _>(1),
                row.get::<i64, _>(2),
                row.get::<i64, _>(3),
            );
        }
        for row in sqlx::query("select file_id, tracer from tracer")
            .fetch_all(pool)
            .await
            .map_err(|e| self.db_err(e))?
        {
            let _ = writeln!(
                script,
                "INSERT INTO tracer (file_id, tracer) VALUES ({}, {});",
                row.get::<i64, _>(0),
                sql_text(&row.get::<Option<String>, _>(1).unwrap_or_default()),
            );
        }

        script.push_str("COMMIT;\n");
        Ok(script)
    }
}

/// A read-only borrow of the measured data, as the analysis layer sees it.
#[async_trait]
pub trait ReadView {
    fn has_arcs(&self) -> bool;
    async fn lines(&mut self, filename: &str) -> Result<Option<Vec<LineNo>>>;
    async fn arcs(&mut self, filename: &str) -> Result<Option<Vec<Arc>>>;
}

#[async_trait]
impl ReadView for CoverageData {
    fn has_arcs(&self) -> bool {
        CoverageData::has_arcs(self)
    }

    async fn lines(&mut self, filename: &str) -> Result<Option<Vec<LineNo>>> {
        CoverageData::lines(self, filename).await
    }

    async fn arcs(&mut self, filename: &str) -> Result<Option<Vec<Arc>>> {
        CoverageData::arcs(self, filename).await
    }
}

fn absolutize(path: Utf8PathBuf) -> Utf8PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
    {
        Some(cwd) => cwd.join(path),
        None => path,
    }
}

fn filename_suffix(suffix: &DataSuffix) -> Option<String> {
    match suffix {
        DataSuffix::None => None,
        DataSuffix::Literal(s) if s.is_empty() => None,
        DataSuffix::Literal(s) => Some(s.clone()),
        DataSuffix::Auto => {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string());
            let random: u32 = rand::rng().random_range(0..0x100_0000);
            Some(format!("{host}.{}.{random:06x}", std::process::id()))
        }
    }
}

/// Delete a file, not minding if it never existed.
fn file_be_gone(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoverageError::data_file(path, &e)),
    }
}

fn push_context_filter(query: &mut String, column: &str, ids: Option<&[i64]>) {
    // SQLite accepts an empty IN list, so an unmatched filter simply
    // selects nothing.
    if let Some(ids) = ids {
        let placeholders = vec!["?"; ids.len()].join(", ");
        let _ = write!(query, " and {column} in ({placeholders})");
    }
}

fn sql_text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_blob(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len() * 2 + 3);
    out.push_str("X'");
    for byte in value {
        let _ = write!(out, "{byte:02x}");
    }
    out.push('\'');
    out
}
