#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDateTime;
use gf_columnar::{ArithmeticOp, Column, ColumnError, ComparisonOp};
use gf_index::{Index, IndexError, IndexLabel, IndexOps};
use gf_runtime::{ExecutionOptions, RuntimeError};
use gf_types::{DType, ErrorKind, Scalar, TypeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// One row keyed by column name, as consumed by [`DataFrame::from_records`].
pub type Record = BTreeMap<String, Scalar>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("{context}: expected length {expected}, found {actual}")]
    LengthMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },
    #[error("column {name:?} not found")]
    ColumnNotFound { name: String },
    #[error("column {name:?} already exists")]
    DuplicateColumn { name: String },
    #[error("{operation} is undefined on an empty dataframe")]
    EmptyFrame { operation: &'static str },
    #[error("{operation} is undefined on empty series {name:?}")]
    EmptySeries { name: String, operation: &'static str },
    #[error("series {name:?} has a null at position {pos}")]
    NullValue { name: String, pos: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("column {name:?}: {source}")]
    InColumn {
        name: String,
        #[source]
        source: ColumnError,
    },
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl FrameError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LengthMismatch { .. } => ErrorKind::InvalidShape,
            Self::ColumnNotFound { .. } => ErrorKind::ColumnNotFound,
            Self::DuplicateColumn { .. } => ErrorKind::DuplicateColumn,
            Self::EmptyFrame { .. } => ErrorKind::EmptyDataFrame,
            Self::EmptySeries { .. } => ErrorKind::EmptySeries,
            Self::NullValue { .. } => ErrorKind::NullValueEncountered,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InColumn { source, .. } | Self::Column(source) => source.kind(),
            Self::Index(err) => err.kind(),
            Self::Type(err) => err.kind(),
            Self::Runtime(err) => err.kind(),
        }
    }
}

fn in_column(name: &str) -> impl FnOnce(ColumnError) -> FrameError + '_ {
    move |source| FrameError::InColumn {
        name: name.to_owned(),
        source,
    }
}

// ── Series ─────────────────────────────────────────────────────────────

/// A named column paired with a shared, immutable row index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SeriesRepr")]
pub struct Series {
    name: String,
    column: Column,
    index: Arc<Index>,
}

#[derive(Deserialize)]
struct SeriesRepr {
    name: String,
    column: Column,
    index: Arc<Index>,
}

impl TryFrom<SeriesRepr> for Series {
    type Error = FrameError;

    fn try_from(repr: SeriesRepr) -> Result<Self, Self::Error> {
        Self::new(repr.name, repr.column, repr.index)
    }
}

impl Series {
    pub fn new(name: impl Into<String>, column: Column, index: Arc<Index>) -> Result<Self, FrameError> {
        let name = name.into();
        if column.len() != index.len() {
            return Err(FrameError::LengthMismatch {
                context: format!("index of series {name:?}"),
                expected: column.len(),
                actual: index.len(),
            });
        }
        Ok(Self { name, column, index })
    }

    /// Series over a default `0..n` index.
    #[must_use]
    pub fn from_column(name: impl Into<String>, column: Column) -> Self {
        let index = Arc::new(Index::range(column.len()));
        Self {
            name: name.into(),
            column,
            index,
        }
    }

    /// Infer the dtype from `values`.
    pub fn from_values(name: impl Into<String>, values: Vec<Scalar>) -> Result<Self, FrameError> {
        let name = name.into();
        let column = Column::from_values(values).map_err(in_column(&name))?;
        Ok(Self::from_column(name, column))
    }

    pub fn with_dtype(
        name: impl Into<String>,
        dtype: DType,
        values: Vec<Scalar>,
    ) -> Result<Self, FrameError> {
        let name = name.into();
        let column = Column::new(dtype, values).map_err(in_column(&name))?;
        Ok(Self::from_column(name, column))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn rename(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: self.column.clone(),
            index: Arc::clone(&self.index),
        }
    }

    #[must_use]
    pub fn column(&self) -> &Column {
        &self.column
    }

    #[must_use]
    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.column.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.column.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.column.is_empty()
    }

    /// Value at `pos`; `None` for a null or an out-of-range position.
    #[must_use]
    pub fn get(&self, pos: usize) -> Option<Scalar> {
        self.column.value(pos)
    }

    /// Value at the first position carrying `label`.
    #[must_use]
    pub fn get_label(&self, label: &IndexLabel) -> Option<Scalar> {
        let positions = self.index.loc(std::slice::from_ref(label)).ok()?;
        positions.first().and_then(|&pos| self.get(pos))
    }

    /// Every position as a scalar, nulls as `Scalar::Null`.
    #[must_use]
    pub fn values(&self) -> Vec<Scalar> {
        self.column.values()
    }

    fn with_column(&self, column: Column) -> Self {
        Self {
            name: self.name.clone(),
            column,
            index: Arc::clone(&self.index),
        }
    }

    fn wrap(&self, result: Result<Column, ColumnError>) -> Result<Self, FrameError> {
        let column = result.map_err(in_column(&self.name))?;
        Ok(self.with_column(column))
    }

    // ── positional and label selection ───────────────────────────────

    /// Gather by position. Order and repetition in `positions` fully
    /// determine the result; the index is gathered the same way.
    pub fn select(&self, positions: &[usize]) -> Result<Self, FrameError> {
        let column = self.column.take(positions).map_err(in_column(&self.name))?;
        let index = self.index.take(positions)?;
        Ok(Self {
            name: self.name.clone(),
            column,
            index: Arc::new(index),
        })
    }

    /// Rows `[start, end)`, sharing value storage with `self`.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self, FrameError> {
        let column = self.column.slice(start, end).map_err(in_column(&self.name))?;
        let index = self.index.slice(start, end)?;
        Ok(Self {
            name: self.name.clone(),
            column,
            index: Arc::new(index),
        })
    }

    #[must_use]
    pub fn head(&self, n: usize) -> Self {
        let end = n.min(self.len());
        self.slice(0, end).unwrap_or_else(|_| self.clone())
    }

    #[must_use]
    pub fn tail(&self, n: usize) -> Self {
        let start = self.len().saturating_sub(n);
        self.slice(start, self.len()).unwrap_or_else(|_| self.clone())
    }

    /// Rows carrying any of `labels`, in request order.
    pub fn loc(&self, labels: &[IndexLabel]) -> Result<Self, FrameError> {
        let positions = self.index.loc(labels)?;
        self.select(&positions)
    }

    // ── element-wise ─────────────────────────────────────────────────

    /// Apply `f` to every non-null value. Null positions stay null and `f`
    /// is never called on them.
    pub fn map<F>(&self, f: F) -> Result<Self, FrameError>
    where
        F: Fn(&Scalar) -> Scalar,
    {
        self.wrap(self.column.map(f))
    }

    pub fn map_with_options<F>(&self, f: F, options: &ExecutionOptions) -> Result<Self, FrameError>
    where
        F: Fn(&Scalar) -> Scalar + Send + Sync + 'static,
    {
        self.wrap(self.column.map_with_options(f, options))
    }

    /// Positional arithmetic; both sides must have the same length. The
    /// result keeps this series' name and index.
    pub fn arithmetic(
        &self,
        other: &Self,
        op: ArithmeticOp,
        options: &ExecutionOptions,
    ) -> Result<Self, FrameError> {
        self.wrap(self.column.binary_numeric_with_options(&other.column, op, options))
    }

    pub fn add(&self, other: &Self) -> Result<Self, FrameError> {
        self.arithmetic(other, ArithmeticOp::Add, &ExecutionOptions::default())
    }

    pub fn sub(&self, other: &Self) -> Result<Self, FrameError> {
        self.arithmetic(other, ArithmeticOp::Sub, &ExecutionOptions::default())
    }

    pub fn mul(&self, other: &Self) -> Result<Self, FrameError> {
        self.arithmetic(other, ArithmeticOp::Mul, &ExecutionOptions::default())
    }

    pub fn div(&self, other: &Self) -> Result<Self, FrameError> {
        self.arithmetic(other, ArithmeticOp::Div, &ExecutionOptions::default())
    }

    pub fn compare(&self, other: &Self, op: ComparisonOp) -> Result<Self, FrameError> {
        self.wrap(self.column.binary_comparison(&other.column, op))
    }

    pub fn gt(&self, other: &Self) -> Result<Self, FrameError> {
        self.compare(other, ComparisonOp::Gt)
    }

    pub fn lt(&self, other: &Self) -> Result<Self, FrameError> {
        self.compare(other, ComparisonOp::Lt)
    }

    pub fn ge(&self, other: &Self) -> Result<Self, FrameError> {
        self.compare(other, ComparisonOp::Ge)
    }

    pub fn le(&self, other: &Self) -> Result<Self, FrameError> {
        self.compare(other, ComparisonOp::Le)
    }

    pub fn eq_series(&self, other: &Self) -> Result<Self, FrameError> {
        self.compare(other, ComparisonOp::Eq)
    }

    pub fn ne_series(&self, other: &Self) -> Result<Self, FrameError> {
        self.compare(other, ComparisonOp::Ne)
    }

    pub fn compare_scalar(&self, scalar: &Scalar, op: ComparisonOp) -> Result<Self, FrameError> {
        self.wrap(self.column.compare_scalar(scalar, op))
    }

    pub fn astype(&self, dtype: DType) -> Result<Self, FrameError> {
        self.wrap(self.column.astype(dtype))
    }

    pub fn fillna(&self, fill: &Scalar) -> Result<Self, FrameError> {
        self.wrap(self.column.fillna(fill))
    }

    /// Bool series marking null positions.
    #[must_use]
    pub fn is_null(&self) -> Self {
        self.with_column(Column::from_bool(self.column.nulls().iter().collect()))
    }

    pub fn dropna(&self) -> Result<Self, FrameError> {
        self.select(&self.column.valid_positions())
    }

    // ── ordering ─────────────────────────────────────────────────────

    /// Stable order of positions; nulls last in either direction.
    #[must_use]
    pub fn argsort(&self, ascending: bool) -> Vec<usize> {
        self.column.argsort(ascending)
    }

    pub fn sort_values(&self, ascending: bool) -> Result<Self, FrameError> {
        self.select(&self.argsort(ascending))
    }

    #[must_use]
    pub fn unique(&self) -> Vec<Scalar> {
        self.column.unique()
    }

    // ── reductions ───────────────────────────────────────────────────

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.column.null_count()
    }

    /// Number of non-null values.
    #[must_use]
    pub fn count(&self) -> usize {
        self.column.count()
    }

    pub fn sum(&self) -> Result<Scalar, FrameError> {
        self.column.sum().map_err(in_column(&self.name))
    }

    /// Sum split across the worker pool once the series is long enough.
    pub fn sum_with_options(&self, options: &ExecutionOptions) -> Result<Scalar, FrameError> {
        self.column.sum_with_options(options).map_err(in_column(&self.name))
    }

    pub fn mean(&self) -> Result<Scalar, FrameError> {
        self.column.mean().map_err(in_column(&self.name))
    }

    pub fn var(&self) -> Result<Scalar, FrameError> {
        self.column.var().map_err(in_column(&self.name))
    }

    pub fn std(&self) -> Result<Scalar, FrameError> {
        self.column.std().map_err(in_column(&self.name))
    }

    pub fn median(&self) -> Result<Scalar, FrameError> {
        self.column.median().map_err(in_column(&self.name))
    }

    #[must_use]
    pub fn min(&self) -> Scalar {
        self.column.min()
    }

    #[must_use]
    pub fn max(&self) -> Scalar {
        self.column.max()
    }

    // ── guards ───────────────────────────────────────────────────────

    /// Fail with `NullValue` at the first null position.
    pub fn require_no_nulls(&self) -> Result<(), FrameError> {
        match (0..self.len()).find(|&pos| self.column.is_null(pos)) {
            Some(pos) => Err(FrameError::NullValue {
                name: self.name.clone(),
                pos,
            }),
            None => Ok(()),
        }
    }

    pub fn require_non_empty(&self, operation: &'static str) -> Result<(), FrameError> {
        if self.is_empty() {
            return Err(FrameError::EmptySeries {
                name: self.name.clone(),
                operation,
            });
        }
        Ok(())
    }
}

// ── DataFrame ──────────────────────────────────────────────────────────

/// Ordered, named columns that share one row index.
///
/// Column names are unique for frames built through constructors and
/// `insert_column`; `select` may repeat a column, in which case name lookups
/// resolve to the first occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FrameRepr", into = "FrameRepr")]
pub struct DataFrame {
    index: Arc<Index>,
    columns: Vec<Series>,
    lookup: HashMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct FrameRepr {
    index: Index,
    columns: Vec<(String, Column)>,
}

impl From<DataFrame> for FrameRepr {
    fn from(frame: DataFrame) -> Self {
        Self {
            index: frame.index.as_ref().clone(),
            columns: frame
                .columns
                .into_iter()
                .map(|series| (series.name, series.column))
                .collect(),
        }
    }
}

impl TryFrom<FrameRepr> for DataFrame {
    type Error = FrameError;

    fn try_from(repr: FrameRepr) -> Result<Self, Self::Error> {
        Self::assemble(Arc::new(repr.index), repr.columns, true)
    }
}

impl Default for DataFrame {
    fn default() -> Self {
        Self {
            index: Arc::new(Index::range(0)),
            columns: Vec::new(),
            lookup: HashMap::new(),
        }
    }
}

impl DataFrame {
    fn assemble(
        index: Arc<Index>,
        columns: Vec<(String, Column)>,
        unique_names: bool,
    ) -> Result<Self, FrameError> {
        let mut lookup = HashMap::with_capacity(columns.len());
        let mut series = Vec::with_capacity(columns.len());
        for (pos, (name, column)) in columns.into_iter().enumerate() {
            if column.len() != index.len() {
                return Err(FrameError::LengthMismatch {
                    context: format!("column {name:?}"),
                    expected: index.len(),
                    actual: column.len(),
                });
            }
            if lookup.contains_key(&name) {
                if unique_names {
                    return Err(FrameError::DuplicateColumn { name });
                }
            } else {
                lookup.insert(name.clone(), pos);
            }
            series.push(Series {
                name,
                column,
                index: Arc::clone(&index),
            });
        }
        Ok(Self {
            index,
            columns: series,
            lookup,
        })
    }

    /// Columns over a default `0..n` index; all columns must share a length.
    pub fn from_columns<N: Into<String>>(
        columns: impl IntoIterator<Item = (N, Column)>,
    ) -> Result<Self, FrameError> {
        let columns: Vec<(String, Column)> =
            columns.into_iter().map(|(name, col)| (name.into(), col)).collect();
        let rows = columns.first().map_or(0, |(_, col)| col.len());
        Self::assemble(Arc::new(Index::range(rows)), columns, true)
    }

    /// Column-name -> values mapping, inferring each column's dtype.
    pub fn from_dict<N: Into<String>>(
        columns: impl IntoIterator<Item = (N, Vec<Scalar>)>,
    ) -> Result<Self, FrameError> {
        let columns = columns
            .into_iter()
            .map(|(name, values)| {
                let name = name.into();
                let column = Column::from_values(values).map_err(in_column(&name))?;
                Ok((name, column))
            })
            .collect::<Result<Vec<_>, FrameError>>()?;
        Self::from_columns(columns)
    }

    /// Series aligned by position; the first series supplies the index.
    pub fn from_series(series: Vec<Series>) -> Result<Self, FrameError> {
        let index = series
            .first()
            .map_or_else(|| Arc::new(Index::range(0)), |s| Arc::clone(&s.index));
        let columns = series.into_iter().map(|s| (s.name, s.column)).collect();
        Self::assemble(index, columns, true)
    }

    /// Build from row records. Columns are the union of every record's keys
    /// in first-seen order; a record without a key contributes a null.
    pub fn from_records(records: &[Record]) -> Result<Self, FrameError> {
        let mut names: Vec<&str> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for record in records {
            for key in record.keys() {
                if seen.insert(key.as_str()) {
                    names.push(key.as_str());
                }
            }
        }
        let columns = names.into_iter().map(|name| {
            let values = records
                .iter()
                .map(|record| record.get(name).cloned().unwrap_or(Scalar::Null))
                .collect();
            (name, values)
        });
        let mut frame = Self::from_dict(columns)?;
        if frame.columns.is_empty() {
            frame.index = Arc::new(Index::range(records.len()));
        }
        debug!(rows = frame.nrows(), cols = frame.ncols(), "dataframe built from records");
        Ok(frame)
    }

    /// Replace the row index; its length must match the row count.
    pub fn with_index(&self, index: Index) -> Result<Self, FrameError> {
        let columns = self.named_columns();
        Self::assemble(Arc::new(index), columns, false)
    }

    fn named_columns(&self) -> Vec<(String, Column)> {
        self.columns
            .iter()
            .map(|s| (s.name.clone(), s.column.clone()))
            .collect()
    }

    fn map_columns(
        &self,
        index: Arc<Index>,
        mut f: impl FnMut(&Series) -> Result<Column, FrameError>,
    ) -> Result<Self, FrameError> {
        let columns = self
            .columns
            .iter()
            .map(|s| Ok((s.name.clone(), f(s)?)))
            .collect::<Result<Vec<_>, FrameError>>()?;
        Self::assemble(index, columns, false)
    }

    // ── shape and access ─────────────────────────────────────────────

    #[must_use]
    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    #[must_use]
    pub fn nrows(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nrows() == 0
    }

    /// Column names in order.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        self.columns.iter().map(|s| s.name.as_str()).collect()
    }

    #[must_use]
    pub fn series(&self) -> &[Series] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Result<&Series, FrameError> {
        self.lookup
            .get(name)
            .map(|&pos| &self.columns[pos])
            .ok_or_else(|| FrameError::ColumnNotFound {
                name: name.to_owned(),
            })
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    /// Columns by name, in request order. Repeated names are honored.
    pub fn select(&self, names: &[&str]) -> Result<Self, FrameError> {
        let columns = names
            .iter()
            .map(|name| {
                let series = self.column(name)?;
                Ok((series.name.clone(), series.column.clone()))
            })
            .collect::<Result<Vec<_>, FrameError>>()?;
        Self::assemble(Arc::clone(&self.index), columns, false)
    }

    /// Append a column; fails on a duplicate name or a length mismatch.
    pub fn insert_column(&mut self, name: impl Into<String>, column: Column) -> Result<(), FrameError> {
        let name = name.into();
        if self.lookup.contains_key(&name) {
            return Err(FrameError::DuplicateColumn { name });
        }
        if self.columns.is_empty() && self.index.is_range() && self.index.is_empty() {
            self.index = Arc::new(Index::range(column.len()));
        }
        if column.len() != self.nrows() {
            return Err(FrameError::LengthMismatch {
                context: format!("column {name:?}"),
                expected: self.nrows(),
                actual: column.len(),
            });
        }
        self.lookup.insert(name.clone(), self.columns.len());
        self.columns.push(Series {
            name,
            column,
            index: Arc::clone(&self.index),
        });
        Ok(())
    }

    /// Copy with `name` replaced, or appended when absent.
    pub fn with_column(&self, name: &str, column: Column) -> Result<Self, FrameError> {
        let mut columns = self.named_columns();
        match self.lookup.get(name) {
            Some(&pos) => columns[pos].1 = column,
            None => columns.push((name.to_owned(), column)),
        }
        Self::assemble(Arc::clone(&self.index), columns, false)
    }

    pub fn drop_column(&self, name: &str) -> Result<Self, FrameError> {
        self.column(name)?;
        let columns = self
            .named_columns()
            .into_iter()
            .filter(|(n, _)| n != name)
            .collect();
        Self::assemble(Arc::clone(&self.index), columns, false)
    }

    pub fn astype_column(&self, name: &str, dtype: DType) -> Result<Self, FrameError> {
        let converted = self.column(name)?.astype(dtype)?;
        self.with_column(name, converted.column)
    }

    // ── row selection ────────────────────────────────────────────────

    /// Gather rows by position across every column and the index.
    pub fn take(&self, positions: &[usize]) -> Result<Self, FrameError> {
        let index = Arc::new(self.index.take(positions)?);
        self.map_columns(index, |s| s.column.take(positions).map_err(in_column(&s.name)))
    }

    /// Rows `[start, end)`; value storage is shared.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self, FrameError> {
        let index = Arc::new(self.index.slice(start, end)?);
        self.map_columns(index, |s| s.column.slice(start, end).map_err(in_column(&s.name)))
    }

    #[must_use]
    pub fn head(&self, n: usize) -> Self {
        self.slice(0, n.min(self.nrows())).unwrap_or_else(|_| self.clone())
    }

    #[must_use]
    pub fn tail(&self, n: usize) -> Self {
        let rows = self.nrows();
        self.slice(rows.saturating_sub(n), rows).unwrap_or_else(|_| self.clone())
    }

    /// Rows carrying any of `labels`, in request order.
    pub fn loc(&self, labels: &[IndexLabel]) -> Result<Self, FrameError> {
        let positions = self.index.loc(labels)?;
        self.take(&positions)
    }

    /// Rows whose timestamp label falls in `[start, end]`. Requires a
    /// datetime index.
    pub fn loc_range(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, FrameError> {
        let positions = self.index.loc_range(start, end)?;
        self.take(&positions)
    }

    pub fn filter<F>(&self, predicate: F) -> Result<Self, FrameError>
    where
        F: Fn(&RowView<'_>) -> bool + Send + Sync + 'static,
    {
        self.filter_with_options(predicate, &ExecutionOptions::default())
    }

    /// Keep rows where `predicate` holds. The predicate runs once per row,
    /// possibly on pool workers; results are merged back in row order.
    #[instrument(name = "frame::filter", level = "debug", skip_all, fields(rows = self.nrows()))]
    pub fn filter_with_options<F>(
        &self,
        predicate: F,
        options: &ExecutionOptions,
    ) -> Result<Self, FrameError>
    where
        F: Fn(&RowView<'_>) -> bool + Send + Sync + 'static,
    {
        let frame = self.clone();
        let flags = options.map(self.nrows(), move |pos| predicate(&RowView::new(&frame, pos)))?;
        let positions: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter_map(|(pos, keep)| keep.then_some(pos))
            .collect();
        trace!(kept = positions.len(), "filter evaluated");
        self.take(&positions)
    }

    /// Keep rows where the bool `mask` is true; null mask entries drop the row.
    pub fn filter_mask(&self, mask: &Series) -> Result<Self, FrameError> {
        if mask.dtype() != DType::Bool {
            return Err(FrameError::InvalidArgument(format!(
                "filter mask {:?} must be bool, found {}",
                mask.name(),
                mask.dtype()
            )));
        }
        if mask.len() != self.nrows() {
            return Err(FrameError::LengthMismatch {
                context: format!("filter mask {:?}", mask.name()),
                expected: self.nrows(),
                actual: mask.len(),
            });
        }
        let positions: Vec<usize> = (0..mask.len())
            .filter(|&pos| mask.get(pos) == Some(Scalar::Bool(true)))
            .collect();
        self.take(&positions)
    }

    /// Stable sort by one column; nulls last.
    pub fn sort_by(&self, name: &str, ascending: bool) -> Result<Self, FrameError> {
        let order = self.column(name)?.argsort(ascending);
        self.take(&order)
    }

    /// Stable lexicographic sort by several columns, most significant first.
    pub fn sort_by_columns(&self, keys: &[(&str, bool)]) -> Result<Self, FrameError> {
        let mut order: Vec<usize> = (0..self.nrows()).collect();
        for &(name, ascending) in keys.iter().rev() {
            let column = self.column(name)?.column().take(&order)?;
            order = column.argsort(ascending).into_iter().map(|pos| order[pos]).collect();
        }
        self.take(&order)
    }

    /// Drop rows holding a null in any of `subset` (every column when empty).
    pub fn dropna(&self, subset: &[&str]) -> Result<Self, FrameError> {
        let checked: Vec<&Series> = if subset.is_empty() {
            self.columns.iter().collect()
        } else {
            subset.iter().map(|name| self.column(name)).collect::<Result<_, _>>()?
        };
        let positions: Vec<usize> = (0..self.nrows())
            .filter(|&pos| checked.iter().all(|s| !s.column.is_null(pos)))
            .collect();
        self.take(&positions)
    }

    /// Fill nulls in every column; fails if `fill` does not fit some column.
    pub fn fillna(&self, fill: &Scalar) -> Result<Self, FrameError> {
        self.map_columns(Arc::clone(&self.index), |s| {
            s.column.fillna(fill).map_err(in_column(&s.name))
        })
    }

    // ── index manipulation ───────────────────────────────────────────

    /// Move `name` into the row index. Null keys are rejected.
    pub fn set_index(&self, name: &str) -> Result<Self, FrameError> {
        let key = self.column(name)?;
        let labels = (0..key.len())
            .map(|pos| {
                IndexLabel::from_scalar(&key.column.scalar(pos))?.ok_or_else(|| FrameError::NullValue {
                    name: name.to_owned(),
                    pos,
                })
            })
            .collect::<Result<Vec<_>, FrameError>>()?;
        self.drop_column(name)?.with_index(Index::from_labels(labels))
    }

    /// Turn the row index into a leading column and restore `0..n` labels.
    pub fn reset_index(&self, name: &str) -> Result<Self, FrameError> {
        if self.has_column(name) {
            return Err(FrameError::DuplicateColumn {
                name: name.to_owned(),
            });
        }
        let labels: Vec<Scalar> = self.index.labels().into_iter().map(Scalar::from).collect();
        let label_column = Column::from_values(labels).map_err(in_column(name))?;
        let mut columns = vec![(name.to_owned(), label_column)];
        columns.extend(self.named_columns());
        Self::assemble(Arc::new(Index::range(self.nrows())), columns, false)
    }

    // ── rows ─────────────────────────────────────────────────────────

    pub fn row(&self, pos: usize) -> Result<RowView<'_>, FrameError> {
        self.require_non_empty("row")?;
        if pos >= self.nrows() {
            return Err(IndexError::OutOfBounds {
                pos,
                len: self.nrows(),
            }
            .into());
        }
        Ok(RowView::new(self, pos))
    }

    pub fn rows(&self) -> impl Iterator<Item = RowView<'_>> + '_ {
        (0..self.nrows()).map(|pos| RowView::new(self, pos))
    }

    /// One record per row, nulls included as `Scalar::Null`.
    #[must_use]
    pub fn to_records(&self) -> Vec<Record> {
        self.rows().map(|row| row.to_record()).collect()
    }

    pub fn require_non_empty(&self, operation: &'static str) -> Result<(), FrameError> {
        if self.is_empty() {
            return Err(FrameError::EmptyFrame { operation });
        }
        Ok(())
    }
}

// ── RowView ────────────────────────────────────────────────────────────

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    frame: &'a DataFrame,
    pos: usize,
}

impl<'a> RowView<'a> {
    fn new(frame: &'a DataFrame, pos: usize) -> Self {
        Self { frame, pos }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn label(&self) -> Result<IndexLabel, FrameError> {
        Ok(self.frame.index.get(self.pos)?)
    }

    /// Value of `column` in this row; `None` when null or the column is absent.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<Scalar> {
        self.frame.column(column).ok()?.get(self.pos)
    }

    /// Like [`RowView::get`] but distinguishes a missing column from a null.
    pub fn try_get(&self, column: &str) -> Result<Option<Scalar>, FrameError> {
        Ok(self.frame.column(column)?.get(self.pos))
    }

    #[must_use]
    pub fn to_record(&self) -> Record {
        self.frame
            .columns
            .iter()
            .map(|s| (s.name.clone(), s.column.scalar(self.pos)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use gf_columnar::{Column, ComparisonOp};
    use gf_index::{Index, IndexLabel, IndexOps};
    use gf_runtime::{ExecutionOptions, PoolConfig, WorkerPool};
    use gf_types::{DType, ErrorKind, Scalar};

    use super::{DataFrame, FrameError, Record, Series};

    fn ints(values: &[Option<i64>]) -> Vec<Scalar> {
        values.iter().map(|v| Scalar::from(*v)).collect()
    }

    fn sample() -> DataFrame {
        DataFrame::from_dict(vec![
            ("id", ints(&[Some(1), Some(2), Some(3), Some(4)])),
            ("score", vec![10.5.into(), Scalar::Null, 7.0.into(), 3.25.into()]),
            ("tag", vec!["a".into(), "b".into(), "a".into(), Scalar::Null]),
        ])
        .expect("frame")
    }

    #[test]
    fn series_get_reports_nulls_and_bounds_as_absent() {
        let s = Series::from_values("x", ints(&[Some(1), None])).expect("series");
        assert_eq!(s.get(0), Some(Scalar::Int64(1)));
        assert_eq!(s.get(1), None);
        assert_eq!(s.get(5), None);
    }

    #[test]
    fn series_new_checks_index_length() {
        let err = Series::new("x", Column::from_i64(vec![1, 2]), Arc::new(Index::range(3)))
            .expect_err("length");
        assert_eq!(err.kind(), ErrorKind::InvalidShape);
    }

    #[test]
    fn series_addition_propagates_nulls() {
        let a = Series::from_values("a", ints(&[Some(1), None, Some(3)])).expect("a");
        let b = Series::from_values("b", ints(&[Some(10), Some(20), None])).expect("b");
        let sum = a.add(&b).expect("add");
        assert_eq!(sum.name(), "a");
        assert_eq!(sum.values(), ints(&[Some(11), None, None]));
        assert!(Arc::ptr_eq(sum.index(), a.index()));
    }

    #[test]
    fn series_map_and_reductions() {
        let s = Series::from_values("v", ints(&[Some(2), None, Some(4)])).expect("s");
        let halved = s
            .map(|v| match v {
                Scalar::Int64(x) => Scalar::Float64(*x as f64 / 2.0),
                other => other.clone(),
            })
            .expect("map");
        assert_eq!(halved.dtype(), DType::Float64);
        assert_eq!(halved.values(), vec![1.0.into(), Scalar::Null, 2.0.into()]);
        assert_eq!(s.sum().expect("sum"), Scalar::Int64(6));
        assert_eq!(
            s.sum_with_options(&ExecutionOptions::sequential()).expect("sum"),
            Scalar::Int64(6)
        );
        assert_eq!(s.mean().expect("mean"), Scalar::Float64(3.0));
        assert_eq!(s.max(), Scalar::Int64(4));
        assert_eq!(s.count(), 2);
        let gt = s.compare_scalar(&Scalar::Int64(3), ComparisonOp::Gt).expect("gt");
        assert_eq!(gt.values(), vec![false.into(), Scalar::Null, true.into()]);
    }

    #[test]
    fn series_sort_is_stable_with_nulls_last() {
        let s = Series::from_values("v", ints(&[Some(3), None, Some(1), None, Some(2)])).expect("s");
        let sorted = s.sort_values(true).expect("sort");
        assert_eq!(sorted.values(), ints(&[Some(1), Some(2), Some(3), None, None]));
        assert_eq!(
            sorted.index().labels(),
            vec![2_i64.into(), 4_i64.into(), 0_i64.into(), 1_i64.into(), 3_i64.into()]
        );
    }

    #[test]
    fn series_select_rejects_bad_positions() {
        let s = Series::from_values("v", ints(&[Some(1)])).expect("s");
        let err = s.select(&[0, 1]).expect_err("oob");
        assert_eq!(err.kind(), ErrorKind::IndexOutOfBounds);
        assert!(err.to_string().contains("\"v\""));
    }

    #[test]
    fn series_astype_and_guards() {
        let s = Series::with_dtype("t", DType::Utf8, vec!["2024-01-02".into(), Scalar::Null])
            .expect("s");
        let times = s.astype(DType::Time).expect("parse");
        assert_eq!(times.dtype(), DType::Time);
        assert_eq!(times.null_count(), 1);
        let err = times.require_no_nulls().expect_err("null");
        assert_eq!(err, FrameError::NullValue { name: "t".into(), pos: 1 });
        assert_eq!(err.kind(), ErrorKind::NullValueEncountered);

        let empty = Series::from_values("e", Vec::new()).expect("empty");
        assert_eq!(
            empty.require_non_empty("mean").expect_err("empty").kind(),
            ErrorKind::EmptySeries
        );
    }

    #[test]
    fn series_loc_and_labels() {
        let s = Series::from_values("v", ints(&[Some(5), Some(6), Some(7)]))
            .expect("s")
            .select(&[2, 0])
            .expect("select");
        assert_eq!(s.get_label(&0_i64.into()), Some(Scalar::Int64(5)));
        assert_eq!(s.loc(&[2_i64.into()]).expect("loc").values(), ints(&[Some(7)]));
        assert!(s.loc(&[1_i64.into()]).is_err());
    }

    #[test]
    fn frame_construction_validates_shape_and_names() {
        let err = DataFrame::from_columns(vec![
            ("a", Column::from_i64(vec![1, 2])),
            ("b", Column::from_i64(vec![1])),
        ])
        .expect_err("shape");
        assert_eq!(err.kind(), ErrorKind::InvalidShape);

        let err = DataFrame::from_columns(vec![
            ("a", Column::from_i64(vec![1])),
            ("a", Column::from_i64(vec![2])),
        ])
        .expect_err("dup");
        assert_eq!(err.kind(), ErrorKind::DuplicateColumn);

        let mut frame = sample();
        let err = frame
            .insert_column("id", Column::from_i64(vec![0; 4]))
            .expect_err("dup insert");
        assert_eq!(err, FrameError::DuplicateColumn { name: "id".into() });
        frame
            .insert_column("flag", Column::from_bool(vec![true; 4]))
            .expect("insert");
        assert_eq!(frame.columns(), vec!["id", "score", "tag", "flag"]);
        assert!(Arc::ptr_eq(frame.column("flag").expect("flag").index(), frame.index()));
    }

    #[test]
    fn frame_accessors() {
        let frame = sample();
        assert_eq!(frame.shape(), (4, 3));
        assert_eq!(frame.column("score").expect("score").dtype(), DType::Float64);
        assert_eq!(
            frame.column("nope").expect_err("missing").kind(),
            ErrorKind::ColumnNotFound
        );
        let row = frame.row(2).expect("row");
        assert_eq!(row.get("tag"), Some(Scalar::Utf8("a".into())));
        assert_eq!(row.get("missing"), None);
        assert!(row.try_get("missing").is_err());
        assert_eq!(frame.row(9).expect_err("oob").kind(), ErrorKind::IndexOutOfBounds);
        assert_eq!(
            DataFrame::default().row(0).expect_err("empty").kind(),
            ErrorKind::EmptyDataFrame
        );
    }

    #[test]
    fn select_allows_repeats_and_shares_storage() {
        let frame = sample();
        let picked = frame.select(&["tag", "id", "tag"]).expect("select");
        assert_eq!(picked.columns(), vec!["tag", "id", "tag"]);
        let first = &picked.series()[0];
        let third = &picked.series()[2];
        assert!(first.column().shares_storage(third.column()));
        assert!(first.column().shares_storage(frame.column("tag").expect("tag").column()));
        assert!(frame.select(&["id", "zzz"]).is_err());
    }

    #[test]
    fn filter_keeps_row_order_across_workers() {
        let pool = Arc::new(WorkerPool::new(PoolConfig::with_workers(3)).expect("pool"));
        let options = ExecutionOptions::with_pool(pool).min_parallel_rows(2);
        let ids: Vec<Scalar> = (0..500).map(Scalar::Int64).collect();
        let frame = DataFrame::from_dict(vec![("id", ids)]).expect("frame");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let kept = frame
            .filter_with_options(
                move |row| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    matches!(row.get("id"), Some(Scalar::Int64(v)) if v % 3 == 0)
                },
                &options,
            )
            .expect("filter");
        assert_eq!(calls.load(Ordering::SeqCst), 500);
        let expected: Vec<Scalar> = (0..500).filter(|v| v % 3 == 0).map(Scalar::Int64).collect();
        assert_eq!(kept.column("id").expect("id").values(), expected);
        assert_eq!(kept.index().get(1).expect("label"), IndexLabel::Int64(3));
    }

    #[test]
    fn filter_treats_null_as_not_matching() {
        let frame = sample();
        let high = frame
            .filter(|row| matches!(row.get("score"), Some(Scalar::Float64(v)) if v > 5.0))
            .expect("filter");
        assert_eq!(high.column("id").expect("id").values(), ints(&[Some(1), Some(3)]));

        let mask = frame.column("score").expect("score").is_null();
        let nulls = frame.filter_mask(&mask).expect("mask");
        assert_eq!(nulls.column("id").expect("id").values(), ints(&[Some(2)]));
    }

    #[test]
    fn sort_by_and_multi_key_sort() {
        let frame = DataFrame::from_dict(vec![
            ("g", vec!["b".into(), "a".into(), "b".into(), "a".into()]),
            ("v", ints(&[Some(1), Some(2), None, Some(1)])),
        ])
        .expect("frame");
        let by_v = frame.sort_by("v", false).expect("sort");
        assert_eq!(by_v.column("v").expect("v").values(), ints(&[Some(2), Some(1), Some(1), None]));
        assert_eq!(by_v.column("g").expect("g").values(), vec!["a".into(), "b".into(), "a".into(), "b".into()]);

        let both = frame.sort_by_columns(&[("g", true), ("v", true)]).expect("sort");
        assert_eq!(both.column("v").expect("v").values(), ints(&[Some(1), Some(2), Some(1), None]));
        assert_eq!(both.column("g").expect("g").values(), vec!["a".into(), "a".into(), "b".into(), "b".into()]);
    }

    #[test]
    fn set_and_reset_index_round_trip() {
        let frame = sample();
        let keyed = frame.set_index("id").expect("set_index");
        assert_eq!(keyed.columns(), vec!["score", "tag"]);
        let picked = keyed.loc(&[3_i64.into(), 1_i64.into()]).expect("loc");
        assert_eq!(picked.column("score").expect("score").values(), vec![7.0.into(), 10.5.into()]);

        let restored = keyed.reset_index("id").expect("reset");
        assert_eq!(restored.columns(), vec!["id", "score", "tag"]);
        assert_eq!(restored.column("id").expect("id").values(), frame.column("id").expect("id").values());
        assert!(restored.index().is_range());

        let err = frame.set_index("tag").expect_err("null key");
        assert_eq!(err.kind(), ErrorKind::NullValueEncountered);
    }

    #[test]
    fn datetime_index_range_selection() {
        let day = |d: u32| {
            NaiveDate::from_ymd_opt(2024, 3, d)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .expect("valid timestamp")
        };
        let frame = DataFrame::from_dict(vec![
            ("at", vec![day(1).into(), day(2).into(), day(5).into()]),
            ("v", ints(&[Some(1), Some(2), Some(3)])),
        ])
        .expect("frame")
        .set_index("at")
        .expect("set_index");
        assert!(frame.index().as_datetime().is_some());
        let window = frame.loc_range(day(2), day(5)).expect("range");
        assert_eq!(window.column("v").expect("v").values(), ints(&[Some(2), Some(3)]));
        assert!(sample().loc_range(day(1), day(2)).is_err());
    }

    #[test]
    fn records_round_trip_with_missing_keys() {
        let records: Vec<Record> = vec![
            [("a".to_owned(), Scalar::Int64(1)), ("b".to_owned(), "x".into())].into_iter().collect(),
            [("a".to_owned(), Scalar::Int64(2))].into_iter().collect(),
            [("c".to_owned(), Scalar::Bool(true))].into_iter().collect(),
        ];
        let frame = DataFrame::from_records(&records).expect("frame");
        assert_eq!(frame.columns(), vec!["a", "b", "c"]);
        assert_eq!(frame.shape(), (3, 3));
        let back = frame.to_records();
        assert_eq!(back[1].get("b"), Some(&Scalar::Null));
        for (original, row) in records.iter().zip(&back) {
            for (key, value) in original {
                assert_eq!(row.get(key), Some(value));
            }
        }
    }

    #[test]
    fn dropna_fillna_head_tail() {
        let frame = sample();
        assert_eq!(frame.dropna(&[]).expect("dropna").nrows(), 2);
        assert_eq!(frame.dropna(&["score"]).expect("dropna").nrows(), 3);
        let gappy = DataFrame::from_dict(vec![("n", ints(&[Some(1), None]))]).expect("frame");
        let err = gappy.fillna(&Scalar::Float64(0.5)).expect_err("lossy fill");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(err.to_string().contains("\"n\""));
        let filled = frame.select(&["score"]).expect("select").fillna(&0.0.into()).expect("fill");
        assert_eq!(filled.column("score").expect("score").null_count(), 0);
        assert_eq!(frame.head(2).nrows(), 2);
        assert_eq!(frame.tail(10).nrows(), 4);
        assert_eq!(frame.tail(1).column("id").expect("id").values(), ints(&[Some(4)]));
    }

    #[test]
    fn with_and_drop_column() {
        let frame = sample();
        let replaced = frame
            .with_column("id", Column::from_i64(vec![9, 9, 9, 9]))
            .expect("replace");
        assert_eq!(replaced.columns(), frame.columns());
        assert_eq!(replaced.column("id").expect("id").get(0), Some(Scalar::Int64(9)));
        let dropped = frame.drop_column("tag").expect("drop");
        assert_eq!(dropped.columns(), vec!["id", "score"]);
        assert!(frame.drop_column("zzz").is_err());
        let typed = frame.astype_column("id", DType::Float64).expect("astype");
        assert_eq!(typed.column("id").expect("id").dtype(), DType::Float64);
    }

    #[test]
    fn frame_serde_round_trip() {
        let frame = sample().set_index("id").expect("set_index");
        let json = serde_json::to_string(&frame).expect("serialize");
        let back: DataFrame = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, frame);
        assert!(Arc::ptr_eq(back.column("tag").expect("tag").index(), back.index()));
    }

    #[test]
    fn series_deserialize_checks_index_length() {
        let series = Series::from_values("v", vec![1_i64.into(), 2_i64.into(), 3_i64.into()]).expect("series");
        let mut value = serde_json::to_value(&series).expect("serialize");
        let back: Series = serde_json::from_value(value.clone()).expect("deserialize");
        assert_eq!(back, series);

        value["index"] = serde_json::to_value(Index::range(2)).expect("index");
        let err = serde_json::from_value::<Series>(value).expect_err("length mismatch");
        assert!(err.to_string().contains("expected length 3"));
    }

    #[test]
    fn category_series_and_frames() {
        let series = Series::with_dtype("grade", DType::Category, vec!["b".into(), Scalar::Null, "a".into()])
            .expect("category series");
        assert_eq!(series.dtype(), DType::Category);
        assert_eq!(series.min(), Scalar::Utf8("a".into()));

        let frame = DataFrame::from_series(vec![series]).expect("frame");
        let json = serde_json::to_string(&frame).expect("serialize");
        let back: DataFrame = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, frame);
        assert_eq!(back.column("grade").expect("grade").dtype(), DType::Category);
    }
}
