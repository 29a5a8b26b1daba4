#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDateTime;
use gf_runtime::{ExecutionOptions, RuntimeError};
use gf_types::{
    DType, ErrorKind, Scalar, ScalarKey, TypeError, cast_scalar, cast_scalar_owned, common_dtype,
    infer_dtype,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── NullMask ───────────────────────────────────────────────────────────

/// Packed missing-value bitset: a set bit marks a null position.
///
/// Positional methods treat `pos >= len()` as a caller bug (checked in debug
/// builds only); [`NullMask::try_is_null`] is the checked form.
#[derive(Debug, Clone, Default, Eq)]
pub struct NullMask {
    words: Vec<u64>,
    len: usize,
}

impl NullMask {
    /// `len` positions, none null.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0_u64; len.div_ceil(64)],
            len,
        }
    }

    #[must_use]
    pub fn all_null(len: usize) -> Self {
        let mut mask = Self {
            words: vec![u64::MAX; len.div_ceil(64)],
            len,
        };
        mask.clear_tail();
        mask
    }

    #[must_use]
    pub fn from_flags(flags: &[bool]) -> Self {
        flags.iter().copied().collect()
    }

    fn clear_tail(&mut self) {
        let remainder = self.len % 64;
        if remainder == 0 {
            return;
        }
        if let Some(last) = self.words.last_mut() {
            *last &= (1_u64 << remainder) - 1;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, pos: usize) {
        debug_assert!(pos < self.len, "null mask position {pos} >= {}", self.len);
        self.words[pos / 64] |= 1_u64 << (pos % 64);
    }

    #[inline]
    pub fn clear(&mut self, pos: usize) {
        debug_assert!(pos < self.len, "null mask position {pos} >= {}", self.len);
        self.words[pos / 64] &= !(1_u64 << (pos % 64));
    }

    #[inline]
    #[must_use]
    pub fn is_null(&self, pos: usize) -> bool {
        debug_assert!(pos < self.len, "null mask position {pos} >= {}", self.len);
        (self.words[pos / 64] >> (pos % 64)) & 1 == 1
    }

    /// `None` when `pos` is out of range.
    #[must_use]
    pub fn try_is_null(&self, pos: usize) -> Option<bool> {
        (pos < self.len).then(|| self.is_null(pos))
    }

    pub fn push(&mut self, null: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        self.len += 1;
        if null {
            self.set(self.len - 1);
        }
    }

    /// Number of null positions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    /// Null wherever either side is null. Both masks must have equal length.
    #[must_use]
    pub fn or(&self, other: &Self) -> Self {
        debug_assert_eq!(self.len, other.len);
        Self {
            words: self.words.iter().zip(&other.words).map(|(a, b)| a | b).collect(),
            len: self.len.min(other.len),
        }
    }

    #[must_use]
    pub fn and(&self, other: &Self) -> Self {
        debug_assert_eq!(self.len, other.len);
        Self {
            words: self.words.iter().zip(&other.words).map(|(a, b)| a & b).collect(),
            len: self.len.min(other.len),
        }
    }

    #[must_use]
    pub fn not(&self) -> Self {
        let mut mask = Self {
            words: self.words.iter().map(|w| !w).collect(),
            len: self.len,
        };
        mask.clear_tail();
        mask
    }

    /// Positions `[start, end)`; the caller guarantees `start <= end <= len`.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Self {
        debug_assert!(start <= end && end <= self.len);
        if start % 64 == 0 {
            let len = end - start;
            let mut mask = Self {
                words: self.words[start / 64..(start / 64 + len.div_ceil(64))].to_vec(),
                len,
            };
            mask.clear_tail();
            return mask;
        }
        (start..end).map(|pos| self.is_null(pos)).collect()
    }

    /// Gather by position; the caller guarantees every position is in range.
    #[must_use]
    pub fn take(&self, positions: &[usize]) -> Self {
        positions.iter().map(|&pos| self.is_null(pos)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|pos| self.is_null(pos))
    }
}

impl FromIterator<bool> for NullMask {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut mask = Self {
            words: Vec::with_capacity(iter.size_hint().0.div_ceil(64)),
            len: 0,
        };
        for null in iter {
            mask.push(null);
        }
        mask
    }
}

impl PartialEq for NullMask {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.words == other.words
    }
}

impl Serialize for NullMask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let bits: Vec<bool> = self.iter().collect();
        let mut state = serializer.serialize_struct("NullMask", 1)?;
        state.serialize_field("bits", &bits)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for NullMask {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            bits: Vec<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Self::from_flags(&raw.bits))
    }
}

// ── Column storage ─────────────────────────────────────────────────────

/// Contiguous typed storage. Null positions hold a default sentinel that is
/// never observed through the public accessors.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Float64(Vec<f64>),
    Int64(Vec<i64>),
    Bool(Vec<bool>),
    Utf8(Vec<String>),
    Time(Vec<NaiveDateTime>),
}

impl ColumnData {
    #[must_use]
    pub fn with_capacity(dtype: DType, capacity: usize) -> Self {
        match dtype {
            DType::Float64 => Self::Float64(Vec::with_capacity(capacity)),
            DType::Int64 => Self::Int64(Vec::with_capacity(capacity)),
            DType::Bool => Self::Bool(Vec::with_capacity(capacity)),
            DType::Utf8 | DType::Category => Self::Utf8(Vec::with_capacity(capacity)),
            DType::Time => Self::Time(Vec::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Float64(d) => d.len(),
            Self::Int64(d) => d.len(),
            Self::Bool(d) => d.len(),
            Self::Utf8(d) => d.len(),
            Self::Time(d) => d.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fits(&self, dtype: DType) -> bool {
        matches!(
            (self, dtype),
            (Self::Float64(_), DType::Float64)
                | (Self::Int64(_), DType::Int64)
                | (Self::Bool(_), DType::Bool)
                | (Self::Utf8(_), DType::Utf8 | DType::Category)
                | (Self::Time(_), DType::Time)
        )
    }

    fn push_sentinel(&mut self) {
        match self {
            Self::Float64(d) => d.push(0.0),
            Self::Int64(d) => d.push(0),
            Self::Bool(d) => d.push(false),
            Self::Utf8(d) => d.push(String::new()),
            Self::Time(d) => d.push(NaiveDateTime::default()),
        }
    }

    /// Append a value already cast to this storage's dtype.
    fn push(&mut self, value: Scalar, dtype: DType) -> Result<(), TypeError> {
        match (self, value) {
            (Self::Float64(d), Scalar::Float64(v)) => d.push(v),
            (Self::Int64(d), Scalar::Int64(v)) => d.push(v),
            (Self::Bool(d), Scalar::Bool(v)) => d.push(v),
            (Self::Utf8(d), Scalar::Utf8(v)) => d.push(v),
            (Self::Time(d), Scalar::Time(v)) => d.push(v),
            (_, other) => {
                return Err(TypeError::DtypeMismatch {
                    value: other.to_string(),
                    dtype,
                });
            }
        }
        Ok(())
    }

    fn scalar(&self, idx: usize) -> Scalar {
        match self {
            Self::Float64(d) => Scalar::Float64(d[idx]),
            Self::Int64(d) => Scalar::Int64(d[idx]),
            Self::Bool(d) => Scalar::Bool(d[idx]),
            Self::Utf8(d) => Scalar::Utf8(d[idx].clone()),
            Self::Time(d) => Scalar::Time(d[idx]),
        }
    }

    fn f64_at(&self, idx: usize) -> f64 {
        match self {
            Self::Float64(d) => d[idx],
            Self::Int64(d) => d[idx] as f64,
            Self::Bool(d) => f64::from(u8::from(d[idx])),
            Self::Utf8(_) | Self::Time(_) => f64::NAN,
        }
    }

    fn i64_at(&self, idx: usize) -> i64 {
        match self {
            Self::Int64(d) => d[idx],
            Self::Bool(d) => i64::from(d[idx]),
            Self::Float64(d) => d[idx] as i64,
            Self::Utf8(_) | Self::Time(_) => 0,
        }
    }

    fn gather(&self, offset: usize, positions: impl Iterator<Item = Option<usize>>) -> Self {
        fn pick<T: Clone + Default>(src: &[T], offset: usize, positions: impl Iterator<Item = Option<usize>>) -> Vec<T> {
            positions
                .map(|slot| slot.map_or_else(T::default, |pos| src[offset + pos].clone()))
                .collect()
        }
        match self {
            Self::Float64(d) => Self::Float64(pick(d, offset, positions)),
            Self::Int64(d) => Self::Int64(pick(d, offset, positions)),
            Self::Bool(d) => Self::Bool(pick(d, offset, positions)),
            Self::Utf8(d) => Self::Utf8(pick(d, offset, positions)),
            Self::Time(d) => Self::Time(pick(d, offset, positions)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
        }
    }
}

/// Element-wise comparison producing `Bool` columns. Nulls on either side
/// give a null result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Gt,
    Lt,
    Eq,
    Ne,
    Ge,
    Le,
}

impl ComparisonOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Gt => ordering == Ordering::Greater,
            Self::Lt => ordering == Ordering::Less,
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Ge => ordering != Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("position {pos} out of bounds for column of length {len}")]
    OutOfBounds { pos: usize, len: usize },
    #[error("slice [{start}, {end}) is invalid for column of length {len}")]
    InvalidSlice { start: usize, end: usize, len: usize },
    #[error("{op} is not supported for dtype {dtype}")]
    UnsupportedOperation { op: &'static str, dtype: DType },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ColumnError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LengthMismatch { .. } => ErrorKind::InvalidShape,
            Self::OutOfBounds { .. } | Self::InvalidSlice { .. } => ErrorKind::IndexOutOfBounds,
            Self::UnsupportedOperation { .. } => ErrorKind::TypeMismatch,
            Self::Type(err) => err.kind(),
            Self::Runtime(err) => err.kind(),
        }
    }
}

// ── Column ─────────────────────────────────────────────────────────────

/// Typed, nullable column.
///
/// Storage sits behind an `Arc` with an `(offset, len)` window, so slicing
/// and cloning share values. Any operation that changes values writes new
/// storage. Float `NaN` is stored as null.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ColumnRepr", into = "ColumnRepr")]
pub struct Column {
    dtype: DType,
    data: Arc<ColumnData>,
    offset: usize,
    len: usize,
    nulls: NullMask,
}

#[derive(Serialize, Deserialize)]
struct ColumnRepr {
    dtype: DType,
    values: Vec<Scalar>,
}

impl From<Column> for ColumnRepr {
    fn from(column: Column) -> Self {
        Self {
            dtype: column.dtype,
            values: column.values(),
        }
    }
}

impl TryFrom<ColumnRepr> for Column {
    type Error = ColumnError;

    fn try_from(repr: ColumnRepr) -> Result<Self, Self::Error> {
        Self::new(repr.dtype, repr.values)
    }
}

impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.len == other.len
            && self.nulls == other.nulls
            && (0..self.len).all(|pos| self.value(pos) == other.value(pos))
    }
}

/// Lossless implicit widening accepted by [`Column::new`]. Text is stored
/// identically for utf8 and category, so either side widens to the other.
fn widens_to(from: DType, to: DType) -> bool {
    (from.is_textual() && to.is_textual())
        || common_dtype(from, to).is_ok_and(|common| common == to)
}

impl Column {
    /// Build a column of `dtype`, widening values where that is lossless
    /// (bool -> int64 -> float64, utf8 <-> category). Anything else is a
    /// dtype mismatch; use [`Column::astype`] for real conversions.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let len = values.len();
        let mut data = ColumnData::with_capacity(dtype, len);
        let mut nulls = NullMask::new(len);
        for (pos, value) in values.into_iter().enumerate() {
            if value.is_missing() {
                nulls.set(pos);
                data.push_sentinel();
                continue;
            }
            let widens = value.dtype().is_some_and(|from| widens_to(from, dtype));
            if !widens {
                return Err(TypeError::DtypeMismatch {
                    value: value.to_string(),
                    dtype,
                }
                .into());
            }
            data.push(cast_scalar_owned(value, dtype)?, dtype)?;
        }
        Ok(Self::from_data(dtype, data, nulls))
    }

    /// Infer the dtype from the non-missing values. A column with no
    /// non-missing values is `Float64`.
    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?.unwrap_or(DType::Float64);
        Self::new(dtype, values)
    }

    /// Assemble a column from typed storage and a matching null mask.
    pub fn from_parts(dtype: DType, data: ColumnData, nulls: NullMask) -> Result<Self, ColumnError> {
        if data.len() != nulls.len() {
            return Err(ColumnError::LengthMismatch {
                left: data.len(),
                right: nulls.len(),
            });
        }
        if !data.fits(dtype) {
            return Err(ColumnError::UnsupportedOperation {
                op: "from_parts",
                dtype,
            });
        }
        Ok(Self::from_data(dtype, data, nulls))
    }

    fn from_data(dtype: DType, mut data: ColumnData, mut nulls: NullMask) -> Self {
        if let ColumnData::Float64(values) = &mut data {
            for (pos, v) in values.iter_mut().enumerate() {
                if v.is_nan() {
                    *v = 0.0;
                    nulls.set(pos);
                }
            }
        }
        let len = data.len();
        Self {
            dtype,
            data: Arc::new(data),
            offset: 0,
            len,
            nulls,
        }
    }

    #[must_use]
    pub fn from_f64(values: Vec<f64>) -> Self {
        let nulls = NullMask::new(values.len());
        Self::from_data(DType::Float64, ColumnData::Float64(values), nulls)
    }

    #[must_use]
    pub fn from_i64(values: Vec<i64>) -> Self {
        let nulls = NullMask::new(values.len());
        Self::from_data(DType::Int64, ColumnData::Int64(values), nulls)
    }

    #[must_use]
    pub fn from_bool(values: Vec<bool>) -> Self {
        let nulls = NullMask::new(values.len());
        Self::from_data(DType::Bool, ColumnData::Bool(values), nulls)
    }

    #[must_use]
    pub fn from_utf8<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let nulls = NullMask::new(values.len());
        Self::from_data(DType::Utf8, ColumnData::Utf8(values), nulls)
    }

    #[must_use]
    pub fn from_times(values: Vec<NaiveDateTime>) -> Self {
        let nulls = NullMask::new(values.len());
        Self::from_data(DType::Time, ColumnData::Time(values), nulls)
    }

    #[must_use]
    pub fn all_null(dtype: DType, len: usize) -> Self {
        let mut data = ColumnData::with_capacity(dtype, len);
        for _ in 0..len {
            data.push_sentinel();
        }
        Self::from_data(dtype, data, NullMask::all_null(len))
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn nulls(&self) -> &NullMask {
        &self.nulls
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.nulls.count()
    }

    /// `true` for null positions and for positions past the end.
    #[must_use]
    pub fn is_null(&self, pos: usize) -> bool {
        self.nulls.try_is_null(pos).unwrap_or(true)
    }

    /// `None` when `pos` is null or out of bounds.
    #[must_use]
    pub fn value(&self, pos: usize) -> Option<Scalar> {
        if self.is_null(pos) {
            return None;
        }
        Some(self.data.scalar(self.offset + pos))
    }

    /// Value at `pos`, with `Scalar::Null` standing in for missing.
    #[must_use]
    pub fn scalar(&self, pos: usize) -> Scalar {
        self.value(pos).unwrap_or(Scalar::Null)
    }

    /// Every position as a scalar, nulls as `Scalar::Null`.
    #[must_use]
    pub fn values(&self) -> Vec<Scalar> {
        (0..self.len).map(|pos| self.scalar(pos)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<Scalar>> + '_ {
        (0..self.len).map(|pos| self.value(pos))
    }

    /// Hashable identity of the value at `pos`; `ScalarKey::Null` for nulls.
    #[must_use]
    pub fn key_at(&self, pos: usize) -> ScalarKey<'_> {
        if self.is_null(pos) {
            return ScalarKey::Null;
        }
        let idx = self.offset + pos;
        match &*self.data {
            ColumnData::Float64(d) if d[idx] == 0.0 => ScalarKey::FloatBits(0.0_f64.to_bits()),
            ColumnData::Float64(d) => ScalarKey::FloatBits(d[idx].to_bits()),
            ColumnData::Int64(d) => ScalarKey::Int64(d[idx]),
            ColumnData::Bool(d) => ScalarKey::Bool(d[idx]),
            ColumnData::Utf8(d) => ScalarKey::Utf8(d[idx].as_str()),
            ColumnData::Time(d) => ScalarKey::Time(d[idx]),
        }
    }

    /// Numeric view of a non-null position. Meaningless for non-numeric dtypes.
    #[must_use]
    pub fn f64_at(&self, pos: usize) -> f64 {
        self.data.f64_at(self.offset + pos)
    }

    /// Window of the float storage, when the dtype is `Float64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &*self.data {
            ColumnData::Float64(d) => Some(&d[self.offset..self.offset + self.len]),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<&[i64]> {
        match &*self.data {
            ColumnData::Int64(d) => Some(&d[self.offset..self.offset + self.len]),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_utf8(&self) -> Option<&[String]> {
        match &*self.data {
            ColumnData::Utf8(d) => Some(&d[self.offset..self.offset + self.len]),
            _ => None,
        }
    }

    /// True when both columns read the same storage allocation.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    // ── positional ────────────────────────────────────────────────────

    /// Zero-copy window `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self, ColumnError> {
        if start > end || end > self.len {
            return Err(ColumnError::InvalidSlice {
                start,
                end,
                len: self.len,
            });
        }
        Ok(Self {
            dtype: self.dtype,
            data: Arc::clone(&self.data),
            offset: self.offset + start,
            len: end - start,
            nulls: self.nulls.slice(start, end),
        })
    }

    /// Gather by position into fresh storage.
    pub fn take(&self, positions: &[usize]) -> Result<Self, ColumnError> {
        if let Some(&pos) = positions.iter().find(|&&pos| pos >= self.len) {
            return Err(ColumnError::OutOfBounds { pos, len: self.len });
        }
        let data = self.data.gather(self.offset, positions.iter().map(|&p| Some(p)));
        Ok(Self::from_data(self.dtype, data, self.nulls.take(positions)))
    }

    /// Gather where `None` (or an out-of-range position) yields null.
    #[must_use]
    pub fn reindex_by_positions(&self, positions: &[Option<usize>]) -> Self {
        let slots = || positions.iter().map(|slot| slot.filter(|&pos| pos < self.len));
        let data = self.data.gather(self.offset, slots());
        let nulls = slots().map(|slot| slot.is_none_or(|pos| self.nulls.is_null(pos))).collect();
        Self::from_data(self.dtype, data, nulls)
    }

    /// Keep positions where `mask` is true; null mask entries count as false.
    pub fn filter_by_mask(&self, mask: &Self) -> Result<Self, ColumnError> {
        if mask.dtype != DType::Bool {
            return Err(ColumnError::UnsupportedOperation {
                op: "filter_by_mask",
                dtype: mask.dtype,
            });
        }
        if self.len != mask.len {
            return Err(ColumnError::LengthMismatch {
                left: self.len,
                right: mask.len,
            });
        }
        let positions: Vec<usize> = (0..mask.len)
            .filter(|&pos| matches!(mask.value(pos), Some(Scalar::Bool(true))))
            .collect();
        self.take(&positions)
    }

    /// Positions of non-null values, in order.
    #[must_use]
    pub fn valid_positions(&self) -> Vec<usize> {
        (0..self.len).filter(|&pos| !self.nulls.is_null(pos)).collect()
    }

    // ── arithmetic and comparison ─────────────────────────────────────

    pub fn binary_numeric(&self, right: &Self, op: ArithmeticOp) -> Result<Self, ColumnError> {
        self.binary_numeric_with_options(right, op, &ExecutionOptions::default())
    }

    /// Element-wise arithmetic. `Int64 (op) Int64` stays `Int64` (wrapping)
    /// except division, which always yields `Float64`. Nulls propagate and
    /// the operation is not evaluated at null positions.
    pub fn binary_numeric_with_options(
        &self,
        right: &Self,
        op: ArithmeticOp,
        options: &ExecutionOptions,
    ) -> Result<Self, ColumnError> {
        self.check_same_len(right)?;
        for dtype in [self.dtype, right.dtype] {
            if !dtype.is_numeric() {
                return Err(ColumnError::UnsupportedOperation { op: op.name(), dtype });
            }
        }
        let mut out_dtype = common_dtype(self.dtype, right.dtype)?;
        if out_dtype == DType::Bool {
            out_dtype = DType::Int64;
        }
        if op == ArithmeticOp::Div {
            out_dtype = DType::Float64;
        }

        let nulls = self.nulls.or(&right.nulls);
        let (left, rhs) = (self.clone(), right.clone());
        let skip = nulls.clone();

        let data = if out_dtype == DType::Int64 {
            let apply: fn(i64, i64) -> i64 = match op {
                ArithmeticOp::Add => i64::wrapping_add,
                ArithmeticOp::Sub => i64::wrapping_sub,
                ArithmeticOp::Mul => i64::wrapping_mul,
                ArithmeticOp::Div => |a, b| a.checked_div(b).unwrap_or(0),
            };
            ColumnData::Int64(options.map(self.len, move |i| {
                if skip.is_null(i) {
                    0
                } else {
                    apply(left.data.i64_at(left.offset + i), rhs.data.i64_at(rhs.offset + i))
                }
            })?)
        } else {
            let apply: fn(f64, f64) -> f64 = match op {
                ArithmeticOp::Add => |a, b| a + b,
                ArithmeticOp::Sub => |a, b| a - b,
                ArithmeticOp::Mul => |a, b| a * b,
                ArithmeticOp::Div => |a, b| a / b,
            };
            ColumnData::Float64(options.map(self.len, move |i| {
                if skip.is_null(i) {
                    0.0
                } else {
                    apply(left.f64_at(i), rhs.f64_at(i))
                }
            })?)
        };

        Ok(Self::from_data(out_dtype, data, nulls))
    }

    fn check_same_len(&self, right: &Self) -> Result<(), ColumnError> {
        if self.len != right.len {
            return Err(ColumnError::LengthMismatch {
                left: self.len,
                right: right.len,
            });
        }
        Ok(())
    }

    fn comparable_with(&self, other: DType) -> Result<(), ColumnError> {
        let left = self.dtype;
        let ok = (left.is_numeric() && other.is_numeric())
            || (left.is_textual() && other.is_textual())
            || (left == DType::Time && other == DType::Time);
        if ok {
            Ok(())
        } else {
            Err(TypeError::IncompatibleDtypes { left, right: other }.into())
        }
    }

    fn cmp_positions(&self, i: usize, other: &Self, j: usize) -> Ordering {
        let (a, b) = (self.offset + i, other.offset + j);
        match (&*self.data, &*other.data) {
            (ColumnData::Utf8(l), ColumnData::Utf8(r)) => l[a].cmp(&r[b]),
            (ColumnData::Time(l), ColumnData::Time(r)) => l[a].cmp(&r[b]),
            (ColumnData::Int64(l), ColumnData::Int64(r)) => l[a].cmp(&r[b]),
            (ColumnData::Bool(l), ColumnData::Bool(r)) => l[a].cmp(&r[b]),
            (l, r) => l.f64_at(a).partial_cmp(&r.f64_at(b)).unwrap_or(Ordering::Equal),
        }
    }

    pub fn binary_comparison(&self, right: &Self, op: ComparisonOp) -> Result<Self, ColumnError> {
        self.binary_comparison_with_options(right, op, &ExecutionOptions::default())
    }

    pub fn binary_comparison_with_options(
        &self,
        right: &Self,
        op: ComparisonOp,
        options: &ExecutionOptions,
    ) -> Result<Self, ColumnError> {
        self.check_same_len(right)?;
        self.comparable_with(right.dtype)?;
        let nulls = self.nulls.or(&right.nulls);
        let (left, rhs, skip) = (self.clone(), right.clone(), nulls.clone());
        let flags = options.map(self.len, move |i| {
            !skip.is_null(i) && op.holds(left.cmp_positions(i, &rhs, i))
        })?;
        Ok(Self::from_data(DType::Bool, ColumnData::Bool(flags), nulls))
    }

    /// Compare every value against `scalar`. A missing scalar yields an
    /// all-null result.
    pub fn compare_scalar(&self, scalar: &Scalar, op: ComparisonOp) -> Result<Self, ColumnError> {
        if scalar.is_missing() {
            return Ok(Self::all_null(DType::Bool, self.len));
        }
        let target = scalar.dtype().unwrap_or(DType::Float64);
        self.comparable_with(target)?;
        let probe = Self::new(target, vec![scalar.clone()])?;
        let flags = (0..self.len)
            .map(|i| !self.nulls.is_null(i) && op.holds(self.cmp_positions(i, &probe, 0)))
            .collect();
        Ok(Self::from_data(DType::Bool, ColumnData::Bool(flags), self.nulls.clone()))
    }

    // ── element-wise transforms ───────────────────────────────────────

    /// Apply `f` to each non-null value; null positions stay null and `f`
    /// is not called for them. The result dtype is inferred from the
    /// outputs, falling back to this column's dtype when all are null.
    pub fn map<F>(&self, f: F) -> Result<Self, ColumnError>
    where
        F: Fn(&Scalar) -> Scalar,
    {
        let out = self
            .iter()
            .map(|value| value.map_or(Scalar::Null, |v| f(&v)))
            .collect();
        self.collect_mapped(out)
    }

    /// [`Column::map`] spread across the worker pool for long columns.
    pub fn map_with_options<F>(&self, f: F, options: &ExecutionOptions) -> Result<Self, ColumnError>
    where
        F: Fn(&Scalar) -> Scalar + Send + Sync + 'static,
    {
        let src = self.clone();
        let out = options.map(self.len, move |i| src.value(i).map_or(Scalar::Null, |v| f(&v)))?;
        self.collect_mapped(out)
    }

    fn collect_mapped(&self, out: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&out)?.unwrap_or(self.dtype);
        Self::new(dtype, out)
    }

    /// Convert to `target`. Nulls pass through untouched; any value that
    /// fails to convert fails the whole column.
    pub fn astype(&self, target: DType) -> Result<Self, ColumnError> {
        if self.dtype == target || (self.dtype.is_textual() && target.is_textual()) {
            let mut out = self.clone();
            out.dtype = target;
            return Ok(out);
        }
        let mut data = ColumnData::with_capacity(target, self.len);
        for pos in 0..self.len {
            match self.value(pos) {
                None => data.push_sentinel(),
                Some(value) => data.push(cast_scalar_owned(value, target)?, target)?,
            }
        }
        Ok(Self::from_data(target, data, self.nulls.clone()))
    }

    /// Replace nulls with `fill` cast to this column's dtype.
    pub fn fillna(&self, fill: &Scalar) -> Result<Self, ColumnError> {
        if fill.is_missing() || !self.nulls.any() {
            return Ok(self.clone());
        }
        let fill = cast_scalar(fill, self.dtype)?;
        let mut data = ColumnData::with_capacity(self.dtype, self.len);
        for pos in 0..self.len {
            let value = self.value(pos).unwrap_or_else(|| fill.clone());
            data.push(value, self.dtype)?;
        }
        Ok(Self::from_data(self.dtype, data, NullMask::new(self.len)))
    }

    /// Stable ordering of positions; nulls go last in either direction.
    #[must_use]
    pub fn argsort(&self, ascending: bool) -> Vec<usize> {
        let (mut order, nulls): (Vec<usize>, Vec<usize>) =
            (0..self.len).partition(|&pos| !self.nulls.is_null(pos));
        if ascending {
            order.sort_by(|&a, &b| self.cmp_positions(a, self, b));
        } else {
            order.sort_by(|&a, &b| self.cmp_positions(b, self, a));
        }
        order.extend(nulls);
        order
    }

    /// Distinct non-null values in first-seen order.
    #[must_use]
    pub fn unique(&self) -> Vec<Scalar> {
        let mut seen = HashSet::new();
        let firsts: Vec<usize> = (0..self.len)
            .filter(|&pos| !self.nulls.is_null(pos) && seen.insert(self.key_at(pos)))
            .collect();
        firsts.into_iter().map(|pos| self.scalar(pos)).collect()
    }

    /// Category labels in first-seen order. Only meaningful for textual columns.
    pub fn categories(&self) -> Result<Vec<String>, ColumnError> {
        if !self.dtype.is_textual() {
            return Err(ColumnError::UnsupportedOperation {
                op: "categories",
                dtype: self.dtype,
            });
        }
        Ok(self
            .unique()
            .into_iter()
            .filter_map(|v| match v {
                Scalar::Utf8(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.len == other.len
            && (0..self.len).all(|pos| self.scalar(pos).semantic_eq(&other.scalar(pos)))
    }

    // ── reductions ────────────────────────────────────────────────────

    fn require_numeric(&self, op: &'static str) -> Result<(), ColumnError> {
        if self.dtype.is_numeric() {
            Ok(())
        } else {
            Err(ColumnError::UnsupportedOperation { op, dtype: self.dtype })
        }
    }

    /// Number of non-null values.
    #[must_use]
    pub fn count(&self) -> usize {
        self.len - self.null_count()
    }

    pub fn sum(&self) -> Result<Scalar, ColumnError> {
        self.sum_with_options(&ExecutionOptions::default())
    }

    /// Sum of the non-null values; `0` when there are none. Integer and
    /// bool columns sum to `Int64`.
    pub fn sum_with_options(&self, options: &ExecutionOptions) -> Result<Scalar, ColumnError> {
        self.require_numeric("sum")?;
        let src = self.clone();
        if self.dtype == DType::Float64 {
            let total = options.reduce(
                self.len,
                0.0_f64,
                move |acc, i| if src.nulls.is_null(i) { acc } else { acc + src.f64_at(i) },
                |a, b| a + b,
            )?;
            return Ok(Scalar::Float64(total));
        }
        let total = options.reduce(
            self.len,
            0_i64,
            move |acc, i| {
                if src.nulls.is_null(i) {
                    acc
                } else {
                    acc.wrapping_add(src.data.i64_at(src.offset + i))
                }
            },
            i64::wrapping_add,
        )?;
        Ok(Scalar::Int64(total))
    }

    fn valid_f64(&self) -> Vec<f64> {
        (0..self.len)
            .filter(|&pos| !self.nulls.is_null(pos))
            .map(|pos| self.f64_at(pos))
            .collect()
    }

    /// Arithmetic mean; null when there are no values.
    pub fn mean(&self) -> Result<Scalar, ColumnError> {
        self.require_numeric("mean")?;
        let values = self.valid_f64();
        if values.is_empty() {
            return Ok(Scalar::Null);
        }
        Ok(Scalar::Float64(values.iter().sum::<f64>() / values.len() as f64))
    }

    /// Sample variance (one degree of freedom); null below two values.
    pub fn var(&self) -> Result<Scalar, ColumnError> {
        self.require_numeric("var")?;
        let values = self.valid_f64();
        if values.len() < 2 {
            return Ok(Scalar::Null);
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
        Ok(Scalar::Float64(ss / (n - 1.0)))
    }

    pub fn std(&self) -> Result<Scalar, ColumnError> {
        Ok(match self.var()? {
            Scalar::Float64(v) => Scalar::Float64(v.sqrt()),
            other => other,
        })
    }

    pub fn median(&self) -> Result<Scalar, ColumnError> {
        self.require_numeric("median")?;
        let mut values = self.valid_f64();
        if values.is_empty() {
            return Ok(Scalar::Null);
        }
        values.sort_by(f64::total_cmp);
        let mid = values.len() / 2;
        Ok(Scalar::Float64(if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        }))
    }

    fn extreme(&self, keep: Ordering) -> Scalar {
        let mut best: Option<usize> = None;
        for pos in 0..self.len {
            if self.nulls.is_null(pos) {
                continue;
            }
            best = match best {
                Some(cur) if self.cmp_positions(pos, self, cur) != keep => Some(cur),
                _ => Some(pos),
            };
        }
        best.map_or(Scalar::Null, |pos| self.scalar(pos))
    }

    /// Smallest non-null value in this column's own dtype; null when empty.
    #[must_use]
    pub fn min(&self) -> Scalar {
        self.extreme(Ordering::Less)
    }

    #[must_use]
    pub fn max(&self) -> Scalar {
        self.extreme(Ordering::Greater)
    }

    #[must_use]
    pub fn first_valid(&self) -> Scalar {
        (0..self.len)
            .find(|&pos| !self.nulls.is_null(pos))
            .map_or(Scalar::Null, |pos| self.scalar(pos))
    }

    #[must_use]
    pub fn last_valid(&self) -> Scalar {
        (0..self.len)
            .rev()
            .find(|&pos| !self.nulls.is_null(pos))
            .map_or(Scalar::Null, |pos| self.scalar(pos))
    }
}
