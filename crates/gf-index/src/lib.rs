#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use gf_types::{DType, ErrorKind, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IndexLabel {
    Int64(i64),
    Utf8(String),
    Time(NaiveDateTime),
    /// Composite label produced by multi-key grouping.
    Tuple(Vec<IndexLabel>),
}

impl From<i64> for IndexLabel {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<&str> for IndexLabel {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for IndexLabel {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl From<NaiveDateTime> for IndexLabel {
    fn from(value: NaiveDateTime) -> Self {
        Self::Time(value)
    }
}

impl fmt::Display for IndexLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v}"),
            Self::Time(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            Self::Tuple(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl IndexLabel {
    /// Label for a non-missing key value. Floats are rejected: they have no
    /// stable equality and make poor row labels.
    pub fn from_scalar(value: &Scalar) -> Result<Option<Self>, IndexError> {
        Ok(match value {
            Scalar::Null => None,
            Scalar::Float64(v) if v.is_nan() => None,
            Scalar::Int64(v) => Some(Self::Int64(*v)),
            Scalar::Bool(v) => Some(Self::Int64(i64::from(*v))),
            Scalar::Utf8(v) => Some(Self::Utf8(v.clone())),
            Scalar::Time(v) => Some(Self::Time(*v)),
            Scalar::Float64(_) => {
                return Err(IndexError::UnsupportedLabel {
                    dtype: DType::Float64,
                });
            }
        })
    }
}

impl From<IndexLabel> for Scalar {
    fn from(label: IndexLabel) -> Self {
        match label {
            IndexLabel::Int64(v) => Scalar::Int64(v),
            IndexLabel::Utf8(v) => Scalar::Utf8(v),
            IndexLabel::Time(v) => Scalar::Time(v),
            tuple @ IndexLabel::Tuple(_) => Scalar::Utf8(tuple.to_string()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("position {pos} out of bounds for index of length {len}")]
    OutOfBounds { pos: usize, len: usize },
    #[error("slice [{start}, {end}) is invalid for index of length {len}")]
    InvalidSlice { start: usize, end: usize, len: usize },
    #[error("label {label} not found in index")]
    KeyNotFound { label: String },
    #[error("range index step must be non-zero")]
    ZeroStep,
    #[error("range {start}..{stop} by {step} has more labels than fit in memory")]
    RangeTooLong { start: i64, stop: i64, step: i64 },
    #[error("{dtype} values cannot be used as index labels")]
    UnsupportedLabel { dtype: DType },
    #[error("{operation} requires a datetime index")]
    NotDatetime { operation: &'static str },
}

impl IndexError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfBounds { .. } | Self::InvalidSlice { .. } => ErrorKind::IndexOutOfBounds,
            Self::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            Self::ZeroStep | Self::RangeTooLong { .. } | Self::NotDatetime { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::UnsupportedLabel { .. } => ErrorKind::TypeMismatch,
        }
    }
}

fn check_pos(pos: usize, len: usize) -> Result<(), IndexError> {
    if pos >= len {
        return Err(IndexError::OutOfBounds { pos, len });
    }
    Ok(())
}

fn check_slice(start: usize, end: usize, len: usize) -> Result<(), IndexError> {
    if start > end || end > len {
        return Err(IndexError::InvalidSlice { start, end, len });
    }
    Ok(())
}

fn check_positions(positions: &[usize], len: usize) -> Result<(), IndexError> {
    match positions.iter().find(|&&pos| pos >= len) {
        Some(&pos) => Err(IndexError::OutOfBounds { pos, len }),
        None => Ok(()),
    }
}

/// Capability shared by every index variant. Indexes are immutable: every
/// method that changes labels returns a new [`Index`].
pub trait IndexOps {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, pos: usize) -> Result<IndexLabel, IndexError>;

    /// Labels at `[start, end)`.
    fn slice(&self, start: usize, end: usize) -> Result<Index, IndexError>;

    /// Positions of every requested label, in request order. Duplicate labels
    /// contribute all their positions in index order.
    fn loc(&self, labels: &[IndexLabel]) -> Result<Vec<usize>, IndexError>;

    /// Gather labels by position; order and repetition follow `positions`.
    fn take(&self, positions: &[usize]) -> Result<Index, IndexError>;

    /// Independent copy sharing no storage with `self`.
    fn deep_copy(&self) -> Index;
}

// ── RangeIndex ─────────────────────────────────────────────────────────

/// Arithmetic progression `start, start + step, ...` stopping before `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RangeParts")]
pub struct RangeIndex {
    start: i64,
    stop: i64,
    step: i64,
}

#[derive(Deserialize)]
struct RangeParts {
    start: i64,
    stop: i64,
    step: i64,
}

impl TryFrom<RangeParts> for RangeIndex {
    type Error = IndexError;

    fn try_from(parts: RangeParts) -> Result<Self, Self::Error> {
        Self::new(parts.start, parts.stop, parts.step)
    }
}

/// Label count of `start..stop` by `step`, computed wide so no bound overflows.
fn range_len(start: i64, stop: i64, step: i64) -> i128 {
    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    let span = stop - start;
    if span == 0 || (span > 0) != (step > 0) {
        return 0;
    }
    // ceil(span / step) for same-signed operands.
    (span + step - step.signum()) / step
}

fn clamp_i64(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

impl RangeIndex {
    pub fn new(start: i64, stop: i64, step: i64) -> Result<Self, IndexError> {
        if step == 0 {
            return Err(IndexError::ZeroStep);
        }
        if usize::try_from(range_len(start, stop, step)).is_err() {
            return Err(IndexError::RangeTooLong { start, stop, step });
        }
        Ok(Self { start, stop, step })
    }

    /// `0..len` with step 1.
    #[must_use]
    pub fn with_len(len: usize) -> Self {
        Self {
            start: 0,
            stop: len as i64,
            step: 1,
        }
    }

    #[must_use]
    pub fn start(&self) -> i64 {
        self.start
    }

    #[must_use]
    pub fn stop(&self) -> i64 {
        self.stop
    }

    #[must_use]
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Label at `pos`. Positions past the end saturate at the i64 bounds,
    /// which no label of this range can reach, so they still work as `stop`.
    fn at(&self, pos: usize) -> i64 {
        let offset = (pos as i128).saturating_mul(i128::from(self.step));
        clamp_i64(i128::from(self.start).saturating_add(offset))
    }

    fn position(&self, value: i64) -> Option<usize> {
        let offset = i128::from(value) - i128::from(self.start);
        let step = i128::from(self.step);
        if offset % step != 0 {
            return None;
        }
        let pos = offset / step;
        if pos < 0 || pos >= range_len(self.start, self.stop, self.step) {
            return None;
        }
        usize::try_from(pos).ok()
    }
}

impl IndexOps for RangeIndex {
    fn len(&self) -> usize {
        usize::try_from(range_len(self.start, self.stop, self.step)).unwrap_or(usize::MAX)
    }

    fn get(&self, pos: usize) -> Result<IndexLabel, IndexError> {
        check_pos(pos, self.len())?;
        Ok(IndexLabel::Int64(self.at(pos)))
    }

    fn slice(&self, start: usize, end: usize) -> Result<Index, IndexError> {
        check_slice(start, end, self.len())?;
        Ok(Index::Range(Self {
            start: self.at(start),
            stop: self.at(end),
            step: self.step,
        }))
    }

    fn loc(&self, labels: &[IndexLabel]) -> Result<Vec<usize>, IndexError> {
        labels
            .iter()
            .map(|label| match label {
                IndexLabel::Int64(v) => self.position(*v),
                _ => None,
            }
            .ok_or_else(|| IndexError::KeyNotFound {
                label: label.to_string(),
            }))
            .collect()
    }

    fn take(&self, positions: &[usize]) -> Result<Index, IndexError> {
        check_positions(positions, self.len())?;
        match positions {
            [] => return Ok(Index::Range(Self::with_len(0))),
            [only] => {
                let start = self.at(*only);
                return Ok(Index::Range(Self {
                    start,
                    stop: clamp_i64(i128::from(start) + i128::from(self.step)),
                    step: self.step,
                }));
            }
            _ => {}
        }
        // An arithmetic run of positions is still a range.
        let stride = positions[1] as i128 - positions[0] as i128;
        let arithmetic = stride != 0
            && positions
                .windows(2)
                .all(|w| w[1] as i128 - w[0] as i128 == stride);
        let step = i128::from(self.step)
            .checked_mul(stride)
            .and_then(|step| i64::try_from(step).ok());
        if let (true, Some(step)) = (arithmetic, step) {
            let start = self.at(positions[0]);
            let stop = i128::from(start).saturating_add((positions.len() as i128).saturating_mul(i128::from(step)));
            return Ok(Index::Range(Self {
                start,
                stop: clamp_i64(stop),
                step,
            }));
        }
        Ok(Index::String(StringIndex::new(
            positions
                .iter()
                .map(|&pos| IndexLabel::Int64(self.at(pos)))
                .collect(),
        )))
    }

    fn deep_copy(&self) -> Index {
        Index::Range(*self)
    }
}

// ── StringIndex ────────────────────────────────────────────────────────

fn build_lookup<K: Clone + Eq + std::hash::Hash>(keys: &[K]) -> HashMap<K, Vec<usize>> {
    let mut lookup: HashMap<K, Vec<usize>> = HashMap::with_capacity(keys.len());
    for (pos, key) in keys.iter().enumerate() {
        lookup.entry(key.clone()).or_default().push(pos);
    }
    lookup
}

/// Materialized labels with a lazily built label -> positions table.
/// Labels need not be unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringIndex {
    labels: Vec<IndexLabel>,
    #[serde(skip)]
    lookup: OnceLock<HashMap<IndexLabel, Vec<usize>>>,
}

impl PartialEq for StringIndex {
    fn eq(&self, other: &Self) -> bool {
        self.labels == other.labels
    }
}

impl Eq for StringIndex {}

impl StringIndex {
    #[must_use]
    pub fn new(labels: Vec<IndexLabel>) -> Self {
        Self {
            labels,
            lookup: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn from_utf8<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self::new(labels.into_iter().map(|s| IndexLabel::Utf8(s.into())).collect())
    }

    #[must_use]
    pub fn labels(&self) -> &[IndexLabel] {
        &self.labels
    }

    fn lookup(&self) -> &HashMap<IndexLabel, Vec<usize>> {
        self.lookup.get_or_init(|| build_lookup(&self.labels))
    }

    /// All positions holding `label`, in index order.
    #[must_use]
    pub fn positions_of(&self, label: &IndexLabel) -> Option<&[usize]> {
        self.lookup().get(label).map(Vec::as_slice)
    }

    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        self.lookup().len() != self.labels.len()
    }
}

impl IndexOps for StringIndex {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, pos: usize) -> Result<IndexLabel, IndexError> {
        self.labels.get(pos).cloned().ok_or(IndexError::OutOfBounds {
            pos,
            len: self.labels.len(),
        })
    }

    fn slice(&self, start: usize, end: usize) -> Result<Index, IndexError> {
        check_slice(start, end, self.labels.len())?;
        Ok(Index::String(Self::new(self.labels[start..end].to_vec())))
    }

    fn loc(&self, labels: &[IndexLabel]) -> Result<Vec<usize>, IndexError> {
        let mut out = Vec::with_capacity(labels.len());
        for label in labels {
            let positions = self.positions_of(label).ok_or_else(|| IndexError::KeyNotFound {
                label: label.to_string(),
            })?;
            out.extend_from_slice(positions);
        }
        Ok(out)
    }

    fn take(&self, positions: &[usize]) -> Result<Index, IndexError> {
        check_positions(positions, self.labels.len())?;
        Ok(Index::String(Self::new(
            positions.iter().map(|&pos| self.labels[pos].clone()).collect(),
        )))
    }

    fn deep_copy(&self) -> Index {
        Index::String(Self::new(self.labels.clone()))
    }
}

// ── DatetimeIndex ──────────────────────────────────────────────────────

/// Timestamp labels. Non-decreasing input is flagged monotonic at
/// construction, which turns range lookups into binary searches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "DatetimeParts", into = "DatetimeParts")]
pub struct DatetimeIndex {
    values: Vec<NaiveDateTime>,
    monotonic: bool,
    #[serde(skip)]
    lookup: OnceLock<HashMap<NaiveDateTime, Vec<usize>>>,
}

/// Persisted form; the monotonic flag is always recomputed on load.
#[derive(Serialize, Deserialize)]
struct DatetimeParts {
    values: Vec<NaiveDateTime>,
}

impl From<DatetimeParts> for DatetimeIndex {
    fn from(parts: DatetimeParts) -> Self {
        Self::new(parts.values)
    }
}

impl From<DatetimeIndex> for DatetimeParts {
    fn from(index: DatetimeIndex) -> Self {
        Self { values: index.values }
    }
}

impl PartialEq for DatetimeIndex {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for DatetimeIndex {}

impl DatetimeIndex {
    #[must_use]
    pub fn new(values: Vec<NaiveDateTime>) -> Self {
        let monotonic = values.windows(2).all(|w| w[0] <= w[1]);
        Self {
            values,
            monotonic,
            lookup: OnceLock::new(),
        }
    }

    /// Parse each string with [`gf_types::parse_time`].
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self, gf_types::TypeError> {
        let parsed = values
            .iter()
            .map(|v| gf_types::parse_time(v.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(parsed))
    }

    #[must_use]
    pub fn values(&self) -> &[NaiveDateTime] {
        &self.values
    }

    #[must_use]
    pub fn is_monotonic(&self) -> bool {
        self.monotonic
    }

    fn lookup(&self) -> &HashMap<NaiveDateTime, Vec<usize>> {
        self.lookup.get_or_init(|| build_lookup(&self.values))
    }

    /// Positions with `start <= t <= end`, in index order.
    ///
    /// O(log n) when the index is monotonic, a full scan otherwise.
    #[must_use]
    pub fn loc_range(&self, start: NaiveDateTime, end: NaiveDateTime) -> Vec<usize> {
        if !self.monotonic {
            return self.loc_range_scan(start, end);
        }
        if start > end {
            return Vec::new();
        }
        let lo = self.values.partition_point(|t| *t < start);
        let hi = self.values.partition_point(|t| *t <= end);
        (lo..hi).collect()
    }

    /// Linear-scan form of [`DatetimeIndex::loc_range`], valid for any order.
    #[must_use]
    pub fn loc_range_scan(&self, start: NaiveDateTime, end: NaiveDateTime) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, t)| start <= **t && **t <= end)
            .map(|(pos, _)| pos)
            .collect()
    }
}

impl IndexOps for DatetimeIndex {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn get(&self, pos: usize) -> Result<IndexLabel, IndexError> {
        self.values
            .get(pos)
            .map(|t| IndexLabel::Time(*t))
            .ok_or(IndexError::OutOfBounds {
                pos,
                len: self.values.len(),
            })
    }

    fn slice(&self, start: usize, end: usize) -> Result<Index, IndexError> {
        check_slice(start, end, self.values.len())?;
        Ok(Index::Datetime(Self {
            values: self.values[start..end].to_vec(),
            monotonic: self.monotonic,
            lookup: OnceLock::new(),
        }))
    }

    fn loc(&self, labels: &[IndexLabel]) -> Result<Vec<usize>, IndexError> {
        let mut out = Vec::with_capacity(labels.len());
        for label in labels {
            let positions = match label {
                IndexLabel::Time(t) => self.lookup().get(t),
                _ => None,
            }
            .ok_or_else(|| IndexError::KeyNotFound {
                label: label.to_string(),
            })?;
            out.extend_from_slice(positions);
        }
        Ok(out)
    }

    fn take(&self, positions: &[usize]) -> Result<Index, IndexError> {
        check_positions(positions, self.values.len())?;
        Ok(Index::Datetime(Self::new(
            positions.iter().map(|&pos| self.values[pos]).collect(),
        )))
    }

    fn deep_copy(&self) -> Index {
        Index::Datetime(Self::new(self.values.clone()))
    }
}

// ── Index ──────────────────────────────────────────────────────────────

/// Row labels for a Series or DataFrame. Callers go through [`IndexOps`]
/// and never need to match on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Index {
    Range(RangeIndex),
    String(StringIndex),
    Datetime(DatetimeIndex),
}

impl Default for Index {
    fn default() -> Self {
        Self::range(0)
    }
}

impl Index {
    /// Default `0..len` labels.
    #[must_use]
    pub fn range(len: usize) -> Self {
        Self::Range(RangeIndex::with_len(len))
    }

    #[must_use]
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self::String(StringIndex::new(values.into_iter().map(IndexLabel::from).collect()))
    }

    #[must_use]
    pub fn from_utf8<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        Self::String(StringIndex::from_utf8(values))
    }

    #[must_use]
    pub fn from_times(values: Vec<NaiveDateTime>) -> Self {
        Self::Datetime(DatetimeIndex::new(values))
    }

    /// Datetime index when every label is a timestamp, otherwise a
    /// lookup-table index.
    #[must_use]
    pub fn from_labels(labels: Vec<IndexLabel>) -> Self {
        if !labels.is_empty() && labels.iter().all(|l| matches!(l, IndexLabel::Time(_))) {
            let values = labels
                .into_iter()
                .filter_map(|l| match l {
                    IndexLabel::Time(t) => Some(t),
                    _ => None,
                })
                .collect();
            return Self::from_times(values);
        }
        Self::String(StringIndex::new(labels))
    }

    fn ops(&self) -> &dyn IndexOps {
        match self {
            Self::Range(ix) => ix,
            Self::String(ix) => ix,
            Self::Datetime(ix) => ix,
        }
    }

    #[must_use]
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Range(_))
    }

    #[must_use]
    pub fn as_datetime(&self) -> Option<&DatetimeIndex> {
        match self {
            Self::Datetime(ix) => Some(ix),
            _ => None,
        }
    }

    /// Materialize every label in order.
    #[must_use]
    pub fn labels(&self) -> Vec<IndexLabel> {
        match self {
            Self::Range(ix) => (0..ix.len()).map(|pos| IndexLabel::Int64(ix.at(pos))).collect(),
            Self::String(ix) => ix.labels.clone(),
            Self::Datetime(ix) => ix.values.iter().map(|t| IndexLabel::Time(*t)).collect(),
        }
    }

    /// Positions within a timestamp range, inclusive on both ends.
    pub fn loc_range(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<usize>, IndexError> {
        self.as_datetime()
            .map(|ix| ix.loc_range(start, end))
            .ok_or(IndexError::NotDatetime {
                operation: "loc_range",
            })
    }

    /// First position of each requested label, `None` where absent.
    #[must_use]
    pub fn get_indexer(&self, labels: &[IndexLabel]) -> Vec<Option<usize>> {
        labels
            .iter()
            .map(|label| self.loc(std::slice::from_ref(label)).ok().and_then(|p| p.first().copied()))
            .collect()
    }
}

impl IndexOps for Index {
    fn len(&self) -> usize {
        self.ops().len()
    }

    fn get(&self, pos: usize) -> Result<IndexLabel, IndexError> {
        self.ops().get(pos)
    }

    fn slice(&self, start: usize, end: usize) -> Result<Index, IndexError> {
        self.ops().slice(start, end)
    }

    fn loc(&self, labels: &[IndexLabel]) -> Result<Vec<usize>, IndexError> {
        self.ops().loc(labels)
    }

    fn take(&self, positions: &[usize]) -> Result<Index, IndexError> {
        self.ops().take(positions)
    }

    fn deep_copy(&self) -> Index {
        self.ops().deep_copy()
    }
}
