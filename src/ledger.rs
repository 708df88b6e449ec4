//! CSV-backed job ledgers.
//!
//! Every artifact of a benchmark run is one CSV table keyed by a stable
//! integer `index`. Tables are written UTF-8 with a leading BOM so they open
//! cleanly in spreadsheet tools, and are always read back after a write: the
//! re-read copy is what callers continue with.

use std::collections::HashMap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};

const BOM: char = '\u{feff}';

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} row {row}: {message}")]
    Parse {
        path: PathBuf,
        row: usize,
        message: String,
    },
    #[error("{path} lost rows or columns on re-read after write")]
    RoundTrip { path: PathBuf },
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

// =============================================================================
// Raw tables
// =============================================================================

/// An untyped CSV table: header names plus string records.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub records: Vec<StringRecord>,
}

impl RawTable {
    /// Read a table from disk. Returns `Ok(None)` when the file is missing or empty.
    pub fn read(path: &Path) -> Result<Option<Self>, LedgerError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LedgerError::io(path, e)),
        };
        let content = content.strip_prefix(BOM).unwrap_or(&content);
        if content.trim().is_empty() {
            return Ok(None);
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(content.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| LedgerError::csv(path, e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let records = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::csv(path, e))?;

        Ok(Some(Self { headers, records }))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    pub fn missing_columns(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.has_column(c))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Values of one column, with empty cells mapped to `None`.
    pub fn column(&self, name: &str) -> Option<Vec<Option<&str>>> {
        let pos = self.headers.iter().position(|h| h == name)?;
        Some(
            self.records
                .iter()
                .map(|r| r.get(pos).map(str::trim).filter(|v| !v.is_empty()))
                .collect(),
        )
    }

    fn fields(&self) -> FieldIndex {
        FieldIndex(
            self.headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), i))
                .collect(),
        )
    }
}

struct FieldIndex(HashMap<String, usize>);

/// One CSV record viewed by column name.
pub struct RowFields<'a> {
    index: &'a FieldIndex,
    record: &'a StringRecord,
}

impl<'a> RowFields<'a> {
    /// Raw cell text; `None` when the column is absent or the cell is empty.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let pos = *self.index.0.get(column)?;
        let value = self.record.get(pos)?;
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    /// Cell text with whitespace-only cells treated as absent.
    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column)
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string)
    }

    /// Finite float, or `None` for empty / non-numeric cells.
    pub fn float(&self, column: &str) -> Option<f64> {
        self.get(column)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

/// Parse an `index` cell, accepting pandas-style `"3.0"`.
pub fn parse_index(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

/// Format an optional float for a CSV cell.
pub fn format_float(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// =============================================================================
// Typed rows
// =============================================================================

/// A row type that can live in a [`Ledger`].
pub trait LedgerRow: Clone + Sized {
    /// Data that fixes the column set (e.g. the pair of model ids).
    type Schema: Clone;

    fn columns(schema: &Self::Schema) -> Vec<String>;

    fn index(&self) -> i64;

    /// Whether the row's key output field is present.
    fn is_done(&self) -> bool;

    /// Cells in `columns` order.
    fn to_fields(&self, schema: &Self::Schema) -> Vec<String>;

    fn from_fields(schema: &Self::Schema, index: i64, fields: &RowFields<'_>) -> Self;
}

/// What was found on disk for a ledger.
#[derive(Debug, Clone)]
pub enum TableState<R> {
    /// No file, or an empty one.
    Missing,
    /// The file lacks required columns.
    Stale {
        row_count: usize,
        missing_columns: Vec<String>,
    },
    Loaded(Vec<R>),
}

impl<R> TableState<R> {
    /// Rows if the table is usable, otherwise an empty table.
    pub fn into_rows(self) -> Vec<R> {
        match self {
            TableState::Loaded(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn rows(&self) -> Option<&[R]> {
        match self {
            TableState::Loaded(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Result of a commit: the table as re-read from disk.
#[derive(Debug, Clone)]
pub struct Committed<R> {
    pub rows: Vec<R>,
    /// Number of rows written.
    pub written: usize,
}

/// One persisted table of `R` rows.
#[derive(Debug, Clone)]
pub struct Ledger<R: LedgerRow> {
    path: PathBuf,
    schema: R::Schema,
    _row: PhantomData<R>,
}

impl<R: LedgerRow> Ledger<R> {
    pub fn new(path: impl Into<PathBuf>, schema: R::Schema) -> Self {
        Self {
            path: path.into(),
            schema,
            _row: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &R::Schema {
        &self.schema
    }

    pub fn columns(&self) -> Vec<String> {
        R::columns(&self.schema)
    }

    /// Load the table, projecting onto the required columns.
    pub fn load(&self) -> Result<TableState<R>, LedgerError> {
        let Some(raw) = RawTable::read(&self.path)? else {
            return Ok(TableState::Missing);
        };

        let missing = raw.missing_columns(&self.columns());
        if !missing.is_empty() {
            return Ok(TableState::Stale {
                row_count: raw.len(),
                missing_columns: missing,
            });
        }

        let fields = raw.fields();
        let mut rows = Vec::with_capacity(raw.len());
        for (i, record) in raw.records.iter().enumerate() {
            let view = RowFields {
                index: &fields,
                record,
            };
            let index = view
                .get("index")
                .and_then(parse_index)
                .ok_or_else(|| LedgerError::Parse {
                    path: self.path.clone(),
                    row: i + 1,
                    message: format!("invalid index {:?}", view.get("index")),
                })?;
            rows.push(R::from_fields(&self.schema, index, &view));
        }
        Ok(TableState::Loaded(rows))
    }

    /// Usable rows, or an empty table when missing or stale.
    pub fn load_rows(&self) -> Result<Vec<R>, LedgerError> {
        Ok(self.load()?.into_rows())
    }

    /// Write `rows`, then re-read the file and return what is actually on disk.
    pub fn commit(&self, rows: &[R]) -> Result<Committed<R>, LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
            }
        }

        let mut buf = String::from(BOM).into_bytes();
        {
            let mut writer = WriterBuilder::new().from_writer(&mut buf);
            writer
                .write_record(self.columns())
                .map_err(|e| LedgerError::csv(&self.path, e))?;
            for row in rows {
                writer
                    .write_record(row.to_fields(&self.schema))
                    .map_err(|e| LedgerError::csv(&self.path, e))?;
            }
            writer
                .flush()
                .map_err(|e| LedgerError::io(&self.path, e))?;
        }

        let tmp = self.path.with_extension("csv.tmp");
        fs::write(&tmp, &buf).map_err(|e| LedgerError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| LedgerError::io(&self.path, e))?;

        match self.load()? {
            TableState::Loaded(reread) if reread.len() == rows.len() => Ok(Committed {
                rows: reread,
                written: rows.len(),
            }),
            // A header-only file reads back as missing.
            TableState::Missing if rows.is_empty() => Ok(Committed {
                rows: Vec::new(),
                written: 0,
            }),
            _ => Err(LedgerError::RoundTrip {
                path: self.path.clone(),
            }),
        }
    }
}

/// Update the row with the same index in place, or append.
pub fn upsert<R: LedgerRow>(rows: &mut Vec<R>, row: R) {
    match rows.iter_mut().find(|r| r.index() == row.index()) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

// =============================================================================
// Row types
// =============================================================================

/// One model's answer to one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    pub index: i64,
    pub prompt: String,
    pub response: Option<String>,
}

impl LedgerRow for ResponseRecord {
    type Schema = ();

    fn columns(_: &()) -> Vec<String> {
        vec!["index".into(), "prompt".into(), "response".into()]
    }

    fn index(&self) -> i64 {
        self.index
    }

    fn is_done(&self) -> bool {
        self.response.is_some()
    }

    fn to_fields(&self, _: &()) -> Vec<String> {
        vec![
            self.index.to_string(),
            self.prompt.clone(),
            self.response.clone().unwrap_or_default(),
        ]
    }

    fn from_fields(_: &(), index: i64, f: &RowFields<'_>) -> Self {
        Self {
            index,
            prompt: f.get("prompt").unwrap_or_default().to_string(),
            response: f.text("response"),
        }
    }
}

/// Judge score for one response.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub index: i64,
    pub prompt: String,
    pub response: Option<String>,
    pub final_score: Option<f64>,
    /// `" | "`-joined log of every judge attempt.
    pub all_reasons: String,
}

impl LedgerRow for ScoreRecord {
    type Schema = ();

    fn columns(_: &()) -> Vec<String> {
        vec![
            "index".into(),
            "prompt".into(),
            "response".into(),
            "final_score".into(),
            "all_reasons".into(),
        ]
    }

    fn index(&self) -> i64 {
        self.index
    }

    fn is_done(&self) -> bool {
        self.final_score.is_some()
    }

    fn to_fields(&self, _: &()) -> Vec<String> {
        vec![
            self.index.to_string(),
            self.prompt.clone(),
            self.response.clone().unwrap_or_default(),
            format_float(self.final_score),
            self.all_reasons.clone(),
        ]
    }

    fn from_fields(_: &(), index: i64, f: &RowFields<'_>) -> Self {
        Self {
            index,
            prompt: f.get("prompt").unwrap_or_default().to_string(),
            response: f.text("response"),
            final_score: f.float("final_score"),
            all_reasons: f.get("all_reasons").unwrap_or_default().to_string(),
        }
    }
}

/// Ordered pair of model ids; fixes a comparison table's column names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairSchema {
    pub a: String,
    pub b: String,
}

impl PairSchema {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
        }
    }

    /// Every `(earlier, later)` pair of `labels`, in order.
    pub fn all_pairs(labels: &[&str]) -> Vec<PairSchema> {
        let mut pairs = Vec::new();
        for (i, a) in labels.iter().enumerate() {
            for b in &labels[i + 1..] {
                pairs.push(PairSchema::new(*a, *b));
            }
        }
        pairs
    }

    pub fn response_a_column(&self) -> String {
        format!("response_{}", self.a)
    }

    pub fn response_b_column(&self) -> String {
        format!("response_{}", self.b)
    }

    pub fn preference_column(&self) -> String {
        format!("prefer_{}_prob", self.a)
    }
}

/// Judge preference between two models' responses to one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRecord {
    pub index: i64,
    pub prompt: String,
    pub response_a: Option<String>,
    pub response_b: Option<String>,
    /// Probability (0-100) that response A is better.
    pub prefer_a_prob: Option<f64>,
    pub all_reasons: String,
}

impl LedgerRow for ComparisonRecord {
    type Schema = PairSchema;

    fn columns(pair: &PairSchema) -> Vec<String> {
        vec![
            "index".into(),
            "prompt".into(),
            pair.response_a_column(),
            pair.response_b_column(),
            pair.preference_column(),
            "all_reasons".into(),
        ]
    }

    fn index(&self) -> i64 {
        self.index
    }

    fn is_done(&self) -> bool {
        self.prefer_a_prob.is_some()
    }

    fn to_fields(&self, _: &PairSchema) -> Vec<String> {
        vec![
            self.index.to_string(),
            self.prompt.clone(),
            self.response_a.clone().unwrap_or_default(),
            self.response_b.clone().unwrap_or_default(),
            format_float(self.prefer_a_prob),
            self.all_reasons.clone(),
        ]
    }

    fn from_fields(pair: &PairSchema, index: i64, f: &RowFields<'_>) -> Self {
        Self {
            index,
            prompt: f.get("prompt").unwrap_or_default().to_string(),
            response_a: f.text(&pair.response_a_column()),
            response_b: f.text(&pair.response_b_column()),
            prefer_a_prob: f.float(&pair.preference_column()),
            all_reasons: f.get("all_reasons").unwrap_or_default().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn response(index: i64, text: Option<&str>) -> ResponseRecord {
        ResponseRecord {
            index,
            prompt: format!("题目{index}"),
            response: text.map(str::to_string),
        }
    }

    #[test]
    fn commit_writes_bom_and_rereads() {
        let dir = tempdir().unwrap();
        let ledger: Ledger<ResponseRecord> = Ledger::new(dir.path().join("r/7B_responses.csv"), ());

        let rows = vec![
            response(0, Some("第一篇,带逗号\n和换行")),
            response(1, None),
        ];
        let committed = ledger.commit(&rows).unwrap();
        assert_eq!(committed.written, 2);
        assert_eq!(committed.rows, rows);

        let bytes = std::fs::read(ledger.path()).unwrap();
        assert!(bytes.starts_with("\u{feff}index,prompt,response".as_bytes()));
    }

    #[test]
    fn missing_file_and_stale_columns() {
        let dir = tempdir().unwrap();
        let pair = PairSchema::new("7B", "14B");
        let path = dir.path().join("7B_vs_14B_comparison.csv");
        let ledger: Ledger<ComparisonRecord> = Ledger::new(&path, pair);
        assert!(matches!(ledger.load().unwrap(), TableState::Missing));

        std::fs::write(&path, "index,prompt,response_7B,response_14B,all_reasons\n0,p,a,b,r\n")
            .unwrap();
        match ledger.load().unwrap() {
            TableState::Stale {
                row_count,
                missing_columns,
            } => {
                assert_eq!(row_count, 1);
                assert_eq!(missing_columns, vec!["prefer_7B_prob".to_string()]);
            }
            other => panic!("expected stale table, got {other:?}"),
        }
        assert!(ledger.load_rows().unwrap().is_empty());
    }

    #[test]
    fn extra_columns_are_projected_away() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7B_single_scores.csv");
        std::fs::write(
            &path,
            "\u{feff}index,prompt,response,final_score,all_reasons,Unnamed: 0\n3.0,p,r,8.5,ok,9\n4,p,r,,bad,10\n",
        )
        .unwrap();
        let ledger: Ledger<ScoreRecord> = Ledger::new(&path, ());
        let rows = ledger.load_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].index, 3);
        assert_eq!(rows[0].final_score, Some(8.5));
        assert!(rows[0].is_done());
        assert_eq!(rows[1].final_score, None);
        assert!(!rows[1].is_done());
    }

    #[test]
    fn invalid_index_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "index,prompt,response\nabc,p,r\n").unwrap();
        let ledger: Ledger<ResponseRecord> = Ledger::new(&path, ());
        assert!(matches!(
            ledger.load(),
            Err(LedgerError::Parse { row: 1, .. })
        ));
    }

    #[test]
    fn upsert_replaces_or_appends() {
        let mut rows = vec![response(0, None), response(1, Some("b"))];
        upsert(&mut rows, response(0, Some("a")));
        upsert(&mut rows, response(5, Some("c")));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].response.as_deref(), Some("a"));
        assert_eq!(rows[2].index, 5);
    }

    #[test]
    fn raw_column_maps_empty_cells_to_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "index,prefer_7B_prob\n0,70\n1,\n").unwrap();
        let raw = RawTable::read(&path).unwrap().unwrap();
        assert_eq!(raw.column("prefer_7B_prob").unwrap(), vec![Some("70"), None]);
        assert!(raw.column("nope").is_none());
    }
}
