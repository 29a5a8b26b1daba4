#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::hash::Hash;
use std::mem::size_of;

use bumpalo::{Bump, collections::Vec as BumpVec};
use gf_columnar::{Column, ColumnError};
use gf_frame::{DataFrame, FrameError, Series};
use gf_index::{Index, IndexLabel};
use gf_types::{DType, ErrorKind, Scalar, ScalarKey, common_dtype};
use thiserror::Error;
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Outer,
}

impl JoinType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inner => "inner",
            Self::Left => "left",
            Self::Right => "right",
            Self::Outer => "outer",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, JoinError> {
        match name {
            "inner" => Ok(Self::Inner),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "outer" => Ok(Self::Outer),
            other => Err(JoinError::UnknownJoinType {
                name: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JoinError {
    #[error("join requires at least one key column")]
    NoKeys,
    #[error("unknown join type {name:?}; expected inner, left, right or outer")]
    UnknownJoinType { name: String },
    #[error("key column {column:?} has incompatible dtypes {left} and {right}")]
    KeyTypeMismatch {
        column: String,
        left: DType,
        right: DType,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

impl JoinError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoKeys | Self::UnknownJoinType { .. } => ErrorKind::InvalidArgument,
            Self::KeyTypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::Frame(err) => err.kind(),
            Self::Column(err) => err.kind(),
        }
    }
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOptions {
    /// Appended to overlapping column names from the left and right frame.
    pub suffixes: (String, String),
    /// Emit one key column filled from whichever side matched. When `false`
    /// both sides' key columns are kept (and suffixed).
    pub coalesce_keys: bool,
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            suffixes: ("_x".to_owned(), "_y".to_owned()),
            coalesce_keys: true,
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

impl JoinOptions {
    #[must_use]
    pub fn suffixes(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.suffixes = (left.into(), right.into());
        self
    }

    #[must_use]
    pub fn coalesce_keys(mut self, coalesce: bool) -> Self {
        self.coalesce_keys = coalesce;
        self
    }

    #[must_use]
    pub fn arena_budget_bytes(mut self, bytes: usize) -> Self {
        self.arena_budget_bytes = bytes;
        self
    }
}

// ── Row matching ───────────────────────────────────────────────────────

/// Hash join over per-row keys. `None` keys are null and never match.
///
/// The probe side drives output order; for right joins the roles swap so
/// the right frame is probed and pairs are flipped back on emission.
struct Matcher<'k, K> {
    probe: &'k [Option<K>],
    build: &'k [Option<K>],
    table: HashMap<&'k K, Vec<usize>>,
    keep_probe: bool,
    keep_build: bool,
    mirrored: bool,
}

impl<'k, K: Hash + Eq> Matcher<'k, K> {
    fn new(left: &'k [Option<K>], right: &'k [Option<K>], how: JoinType) -> Self {
        let (probe, build, mirrored) = match how {
            JoinType::Right => (right, left, true),
            _ => (left, right, false),
        };
        let mut table: HashMap<&K, Vec<usize>> = HashMap::new();
        for (pos, key) in build.iter().enumerate() {
            if let Some(key) = key {
                table.entry(key).or_default().push(pos);
            }
        }
        Self {
            probe,
            build,
            table,
            keep_probe: how != JoinType::Inner,
            keep_build: how == JoinType::Outer,
            mirrored,
        }
    }

    fn matches(&self, key: &Option<K>) -> Option<&[usize]> {
        key.as_ref()
            .and_then(|key| self.table.get(key))
            .map(Vec::as_slice)
    }

    /// Output row count, exact for everything but the unmatched tail of an
    /// outer join, which is bounded by the build side length.
    fn estimate_rows(&self) -> usize {
        let probed: usize = self
            .probe
            .iter()
            .map(|key| match self.matches(key) {
                Some(found) => found.len(),
                None => usize::from(self.keep_probe),
            })
            .sum();
        if self.keep_build {
            probed + self.build.len()
        } else {
            probed
        }
    }

    fn emit(&self, mut sink: impl FnMut(Option<usize>, Option<usize>)) {
        let mut pair = |probe: Option<usize>, build: Option<usize>| {
            if self.mirrored {
                sink(build, probe);
            } else {
                sink(probe, build);
            }
        };
        let mut matched = vec![false; if self.keep_build { self.build.len() } else { 0 }];
        for (pos, key) in self.probe.iter().enumerate() {
            match self.matches(key) {
                Some(found) => {
                    for &other in found {
                        if self.keep_build {
                            matched[other] = true;
                        }
                        pair(Some(pos), Some(other));
                    }
                }
                None if self.keep_probe => pair(Some(pos), None),
                None => {}
            }
        }
        for (pos, _) in matched.iter().enumerate().filter(|(_, hit)| !**hit) {
            pair(None, Some(pos));
        }
    }
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<Option<usize>>().saturating_mul(2))
}

/// Run the matcher and hand both position vectors to `materialize`. The
/// vectors live in a bump arena when they fit the byte budget.
fn with_positions<K: Hash + Eq, R>(
    left: &[Option<K>],
    right: &[Option<K>],
    how: JoinType,
    options: &JoinOptions,
    materialize: impl FnOnce(&[Option<usize>], &[Option<usize>]) -> R,
) -> R {
    let matcher = Matcher::new(left, right, how);
    let estimated_rows = matcher.estimate_rows();
    let estimated_bytes = estimate_intermediate_bytes(estimated_rows);
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;
    trace!(estimated_rows, estimated_bytes, use_arena, "join positions");

    if use_arena {
        let arena = Bump::new();
        let mut left_positions = BumpVec::<Option<usize>>::with_capacity_in(estimated_rows, &arena);
        let mut right_positions = BumpVec::<Option<usize>>::with_capacity_in(estimated_rows, &arena);
        matcher.emit(|l, r| {
            left_positions.push(l);
            right_positions.push(r);
        });
        materialize(left_positions.as_slice(), right_positions.as_slice())
    } else {
        let mut left_positions = Vec::with_capacity(estimated_rows);
        let mut right_positions = Vec::with_capacity(estimated_rows);
        matcher.emit(|l, r| {
            left_positions.push(l);
            right_positions.push(r);
        });
        materialize(&left_positions, &right_positions)
    }
}

// ── Frame joins ────────────────────────────────────────────────────────

/// Key columns of both sides cast to a shared dtype, so `1` and `1.0` match.
fn aligned_keys(left: &DataFrame, right: &DataFrame, on: &[&str]) -> Result<(Vec<Column>, Vec<Column>), JoinError> {
    let mut lefts = Vec::with_capacity(on.len());
    let mut rights = Vec::with_capacity(on.len());
    for &name in on {
        let l = left.column(name)?.column();
        let r = right.column(name)?.column();
        if l.dtype() == r.dtype() {
            lefts.push(l.clone());
            rights.push(r.clone());
            continue;
        }
        let target = common_dtype(l.dtype(), r.dtype()).map_err(|_| JoinError::KeyTypeMismatch {
            column: name.to_owned(),
            left: l.dtype(),
            right: r.dtype(),
        })?;
        lefts.push(l.astype(target)?);
        rights.push(r.astype(target)?);
    }
    Ok((lefts, rights))
}

fn row_keys(columns: &[Column], rows: usize) -> Vec<Option<Vec<ScalarKey<'_>>>> {
    (0..rows)
        .map(|pos| {
            columns
                .iter()
                .map(|col| Some(col.key_at(pos)).filter(|key| !key.is_null()))
                .collect()
        })
        .collect()
}

fn coalesce(left: &Column, right: &Column) -> Result<Column, ColumnError> {
    let values = (0..left.len())
        .map(|pos| left.scalar(pos).coalesce(&right.scalar(pos)))
        .collect();
    Column::new(left.dtype(), values)
}

pub fn join(left: &DataFrame, right: &DataFrame, on: &[&str], how: JoinType) -> Result<DataFrame, JoinError> {
    join_with_options(left, right, on, how, &JoinOptions::default())
}

/// Relational join on equal values of the `on` columns.
///
/// Output rows are probe-row-major: left rows in order (right rows for a
/// right join), each followed by every match in the other frame's order.
/// Outer joins append the unmatched right rows last. The result carries a
/// fresh `0..n` index. Left columns come first, then the right frame's
/// non-key columns; names present on both sides get the configured suffixes.
#[instrument(name = "join::frame", level = "trace", skip_all, fields(how = how.as_str(), left_rows = left.nrows(), right_rows = right.nrows()))]
pub fn join_with_options(
    left: &DataFrame,
    right: &DataFrame,
    on: &[&str],
    how: JoinType,
    options: &JoinOptions,
) -> Result<DataFrame, JoinError> {
    if on.is_empty() {
        return Err(JoinError::NoKeys);
    }
    let (left_keys, right_keys) = aligned_keys(left, right, on)?;
    let left_rows = row_keys(&left_keys, left.nrows());
    let right_rows = row_keys(&right_keys, right.nrows());

    let is_key = |name: &str| on.contains(&name);
    let skip_right_key = |name: &str| options.coalesce_keys && is_key(name);
    let (left_suffix, right_suffix) = &options.suffixes;

    let columns = with_positions(&left_rows, &right_rows, how, options, |lp, rp| {
        let mut out: Vec<(String, Column)> = Vec::with_capacity(left.ncols() + right.ncols());
        for series in left.series() {
            let name = series.name();
            if skip_right_key(name) {
                let slot = on.iter().position(|&k| k == name).unwrap_or_default();
                let merged = coalesce(
                    &left_keys[slot].reindex_by_positions(lp),
                    &right_keys[slot].reindex_by_positions(rp),
                )?;
                out.push((name.to_owned(), merged));
                continue;
            }
            let clash = right.has_column(name) && !skip_right_key(name);
            let label = if clash { format!("{name}{left_suffix}") } else { name.to_owned() };
            out.push((label, series.column().reindex_by_positions(lp)));
        }
        for series in right.series() {
            let name = series.name();
            if skip_right_key(name) {
                continue;
            }
            let label = if left.has_column(name) { format!("{name}{right_suffix}") } else { name.to_owned() };
            out.push((label, series.column().reindex_by_positions(rp)));
        }
        Ok::<_, JoinError>(out)
    })?;

    let rows = columns.first().map_or(0, |(_, col)| col.len());
    let frame = DataFrame::from_columns(columns)?;
    debug!(rows, how = how.as_str(), "join finished");
    Ok(frame)
}

/// Join entry points on [`DataFrame`].
pub trait JoinExt {
    fn join(&self, other: &DataFrame, on: &[&str], how: JoinType) -> Result<DataFrame, JoinError>;

    fn join_with(
        &self,
        other: &DataFrame,
        on: &[&str],
        how: JoinType,
        options: &JoinOptions,
    ) -> Result<DataFrame, JoinError>;
}

impl JoinExt for DataFrame {
    fn join(&self, other: &DataFrame, on: &[&str], how: JoinType) -> Result<DataFrame, JoinError> {
        join_with_options(self, other, on, how, &JoinOptions::default())
    }

    fn join_with(
        &self,
        other: &DataFrame,
        on: &[&str],
        how: JoinType,
        options: &JoinOptions,
    ) -> Result<DataFrame, JoinError> {
        join_with_options(self, other, on, how, options)
    }
}

// ── Index joins ────────────────────────────────────────────────────────

/// Values of two series paired by equal index labels.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedSeries {
    pub index: Index,
    pub left_values: Column,
    pub right_values: Column,
}

pub fn join_series(left: &Series, right: &Series, how: JoinType) -> Result<JoinedSeries, JoinError> {
    join_series_with_options(left, right, how, &JoinOptions::default())
}

/// Align two series on their index labels. Each output row is labelled
/// with the label of whichever side is present.
pub fn join_series_with_options(
    left: &Series,
    right: &Series,
    how: JoinType,
    options: &JoinOptions,
) -> Result<JoinedSeries, JoinError> {
    let left_labels: Vec<Option<IndexLabel>> = left.index().labels().into_iter().map(Some).collect();
    let right_labels: Vec<Option<IndexLabel>> = right.index().labels().into_iter().map(Some).collect();

    let joined = with_positions(&left_labels, &right_labels, how, options, |lp, rp| {
        let labels: Vec<IndexLabel> = lp
            .iter()
            .zip(rp)
            .filter_map(|(l, r)| {
                l.and_then(|pos| left_labels[pos].clone())
                    .or_else(|| r.and_then(|pos| right_labels[pos].clone()))
            })
            .collect();
        JoinedSeries {
            index: Index::from_labels(labels),
            left_values: left.column().reindex_by_positions(lp),
            right_values: right.column().reindex_by_positions(rp),
        }
    });
    Ok(joined)
}

/// Rows `(left value, right value)` of a joined series pair, for inspection.
#[must_use]
pub fn joined_pairs(joined: &JoinedSeries) -> Vec<(Scalar, Scalar)> {
    (0..joined.left_values.len())
        .map(|pos| (joined.left_values.scalar(pos), joined.right_values.scalar(pos)))
        .collect()
}

#[cfg(test)]
mod tests {
    use gf_columnar::Column;
    use gf_frame::{DataFrame, Series};
    use gf_index::{Index, IndexLabel, IndexOps};
    use gf_types::{DType, ErrorKind, Scalar};

    use super::{JoinError, JoinExt, JoinOptions, JoinType, join_series, joined_pairs};

    fn ints(values: &[Option<i64>]) -> Vec<Scalar> {
        values.iter().map(|v| Scalar::from(*v)).collect()
    }

    fn text(values: &[Option<&str>]) -> Vec<Scalar> {
        values.iter().map(|v| Scalar::from(*v)).collect()
    }

    fn left_ids() -> DataFrame {
        DataFrame::from_dict(vec![("id", ints(&[Some(1), Some(2)]))]).expect("left")
    }

    fn right_values() -> DataFrame {
        DataFrame::from_dict(vec![
            ("id", ints(&[Some(2), Some(3)])),
            ("v", text(&[Some("x"), Some("y")])),
        ])
        .expect("right")
    }

    fn rows(frame: &DataFrame) -> Vec<Vec<Scalar>> {
        frame
            .rows()
            .map(|row| frame.columns().iter().map(|c| row.get(c).unwrap_or(Scalar::Null)).collect())
            .collect()
    }

    #[test]
    fn left_inner_outer_on_single_key() {
        let left = left_ids();
        let right = right_values();

        let joined = left.join(&right, &["id"], JoinType::Left).expect("left join");
        assert_eq!(joined.columns(), vec!["id", "v"]);
        assert_eq!(
            rows(&joined),
            vec![vec![1_i64.into(), Scalar::Null], vec![2_i64.into(), "x".into()]]
        );

        let joined = left.join(&right, &["id"], JoinType::Inner).expect("inner join");
        assert_eq!(rows(&joined), vec![vec![2_i64.into(), "x".into()]]);

        let joined = left.join(&right, &["id"], JoinType::Outer).expect("outer join");
        assert_eq!(
            rows(&joined),
            vec![
                vec![1_i64.into(), Scalar::Null],
                vec![2_i64.into(), "x".into()],
                vec![3_i64.into(), "y".into()],
            ]
        );
        assert!(joined.index().is_range());
    }

    #[test]
    fn outer_join_can_keep_both_key_columns() {
        let options = JoinOptions::default().coalesce_keys(false);
        let joined = left_ids()
            .join_with(&right_values(), &["id"], JoinType::Outer, &options)
            .expect("outer join");
        assert_eq!(joined.columns(), vec!["id_x", "id_y", "v"]);
        assert_eq!(
            rows(&joined),
            vec![
                vec![1_i64.into(), Scalar::Null, Scalar::Null],
                vec![2_i64.into(), 2_i64.into(), "x".into()],
                vec![Scalar::Null, 3_i64.into(), "y".into()],
            ]
        );
    }

    #[test]
    fn right_join_mirrors_left_join() {
        let joined = left_ids()
            .join(&right_values(), &["id"], JoinType::Right)
            .expect("right join");
        assert_eq!(
            rows(&joined),
            vec![vec![2_i64.into(), "x".into()], vec![3_i64.into(), "y".into()]]
        );
    }

    #[test]
    fn duplicate_keys_emit_cross_product_in_left_major_order() {
        let left = DataFrame::from_dict(vec![
            ("k", text(&[Some("a"), Some("b"), Some("a")])),
            ("l", ints(&[Some(1), Some(2), Some(3)])),
        ])
        .expect("left");
        let right = DataFrame::from_dict(vec![
            ("k", text(&[Some("a"), Some("a"), Some("c")])),
            ("r", ints(&[Some(10), Some(20), Some(30)])),
        ])
        .expect("right");
        let joined = left.join(&right, &["k"], JoinType::Inner).expect("inner");
        assert_eq!(joined.column("l").expect("l").values(), ints(&[Some(1), Some(1), Some(3), Some(3)]));
        assert_eq!(
            joined.column("r").expect("r").values(),
            ints(&[Some(10), Some(20), Some(10), Some(20)])
        );

        let right_major = left.join(&right, &["k"], JoinType::Right).expect("right");
        assert_eq!(
            right_major.column("r").expect("r").values(),
            ints(&[Some(10), Some(10), Some(20), Some(20), Some(30)])
        );
        assert_eq!(
            right_major.column("l").expect("l").values(),
            ints(&[Some(1), Some(3), Some(1), Some(3), None])
        );
    }

    #[test]
    fn null_keys_never_match() {
        let left = DataFrame::from_dict(vec![
            ("k", ints(&[None, Some(1)])),
            ("l", text(&[Some("ln"), Some("l1")])),
        ])
        .expect("left");
        let right = DataFrame::from_dict(vec![
            ("k", ints(&[None, Some(1)])),
            ("r", text(&[Some("rn"), Some("r1")])),
        ])
        .expect("right");
        let inner = left.join(&right, &["k"], JoinType::Inner).expect("inner");
        assert_eq!(inner.nrows(), 1);
        assert_eq!(inner.column("r").expect("r").values(), text(&[Some("r1")]));

        let outer = left.join(&right, &["k"], JoinType::Outer).expect("outer");
        assert_eq!(outer.column("l").expect("l").values(), text(&[Some("ln"), Some("l1"), None]));
        assert_eq!(outer.column("r").expect("r").values(), text(&[None, Some("r1"), Some("rn")]));
        assert_eq!(outer.column("k").expect("k").values(), ints(&[None, Some(1), None]));
    }

    #[test]
    fn multi_key_join_and_suffixes() {
        let left = DataFrame::from_dict(vec![
            ("a", text(&[Some("x"), Some("x"), Some("y")])),
            ("b", ints(&[Some(1), Some(2), Some(1)])),
            ("v", ints(&[Some(100), Some(200), Some(300)])),
        ])
        .expect("left");
        let right = DataFrame::from_dict(vec![
            ("a", text(&[Some("x"), Some("y")])),
            ("b", ints(&[Some(2), Some(1)])),
            ("v", ints(&[Some(7), Some(8)])),
        ])
        .expect("right");
        let options = JoinOptions::default().suffixes("_l", "_r");
        let joined = left
            .join_with(&right, &["a", "b"], JoinType::Left, &options)
            .expect("join");
        assert_eq!(joined.columns(), vec!["a", "b", "v_l", "v_r"]);
        assert_eq!(joined.column("v_r").expect("v_r").values(), ints(&[None, Some(7), Some(8)]));
    }

    #[test]
    fn numeric_keys_are_promoted_before_matching() {
        let left = DataFrame::from_dict(vec![("id", ints(&[Some(1), Some(2)]))]).expect("left");
        let right = DataFrame::from_dict(vec![
            ("id", vec![2.0.into(), 1.0.into()]),
            ("w", text(&[Some("two"), Some("one")])),
        ])
        .expect("right");
        let joined = left.join(&right, &["id"], JoinType::Inner).expect("join");
        assert_eq!(joined.column("id").expect("id").dtype(), DType::Float64);
        assert_eq!(joined.column("w").expect("w").values(), text(&[Some("one"), Some("two")]));

        let words = DataFrame::from_dict(vec![("id", text(&[Some("1")]))]).expect("words");
        let err = left.join(&words, &["id"], JoinType::Inner).expect_err("mismatch");
        assert_eq!(
            err,
            JoinError::KeyTypeMismatch { column: "id".into(), left: DType::Int64, right: DType::Utf8 }
        );
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn category_keys_join_and_coalesce() {
        let grades = |values: &[Option<&str>]| Series::with_dtype("grade", DType::Category, text(values)).expect("grade");
        let left = DataFrame::from_series(vec![
            grades(&[Some("a"), Some("b"), None]),
            Series::from_values("n", ints(&[Some(1), Some(2), Some(3)])).expect("n"),
        ])
        .expect("left");
        let right = DataFrame::from_series(vec![
            grades(&[Some("b"), Some("c")]),
            Series::from_values("w", text(&[Some("bee"), Some("sea")])).expect("w"),
        ])
        .expect("right");

        let inner = left.join(&right, &["grade"], JoinType::Inner).expect("inner");
        assert_eq!(inner.column("grade").expect("grade").dtype(), DType::Category);
        assert_eq!(rows(&inner), vec![vec!["b".into(), 2_i64.into(), "bee".into()]]);

        let outer = left.join(&right, &["grade"], JoinType::Outer).expect("outer");
        assert_eq!(
            outer.column("grade").expect("grade").values(),
            text(&[Some("a"), Some("b"), None, Some("c")])
        );

        let plain = DataFrame::from_dict(vec![("grade", text(&[Some("a")]))]).expect("plain");
        let mixed = left.join(&plain, &["grade"], JoinType::Inner).expect("utf8 against category");
        assert_eq!(mixed.nrows(), 1);
        assert_eq!(mixed.column("grade").expect("grade").dtype(), DType::Utf8);
    }

    #[test]
    fn arena_budget_does_not_change_results() {
        let left = DataFrame::from_dict(vec![("k", ints(&(0..50).map(|i| Some(i % 7)).collect::<Vec<_>>()))])
            .expect("left");
        let right = DataFrame::from_dict(vec![
            ("k", ints(&(0..20).map(|i| Some(i % 5)).collect::<Vec<_>>())),
            ("r", ints(&(0..20).map(Some).collect::<Vec<_>>())),
        ])
        .expect("right");
        for how in [JoinType::Inner, JoinType::Left, JoinType::Right, JoinType::Outer] {
            let arena = left.join(&right, &["k"], how).expect("arena");
            let heap = left
                .join_with(&right, &["k"], how, &JoinOptions::default().arena_budget_bytes(0))
                .expect("heap");
            assert_eq!(arena, heap, "how={}", how.as_str());
        }
    }

    #[test]
    fn argument_errors() {
        let left = left_ids();
        let right = right_values();
        assert_eq!(left.join(&right, &[], JoinType::Inner).expect_err("no keys"), JoinError::NoKeys);
        assert_eq!(
            left.join(&right, &["v"], JoinType::Inner).expect_err("missing").kind(),
            ErrorKind::ColumnNotFound
        );
        let err = JoinType::from_name("cross").expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(JoinType::from_name("outer").expect("outer"), JoinType::Outer);
    }

    #[test]
    fn series_join_on_index_labels() {
        let left = Series::new(
            "l",
            Column::from_i64(vec![1, 2, 3]),
            Index::from_utf8(["a", "b", "c"]).into(),
        )
        .expect("left");
        let right = Series::new(
            "r",
            Column::from_f64(vec![0.5, 1.5]),
            Index::from_utf8(["c", "d"]).into(),
        )
        .expect("right");

        let inner = join_series(&left, &right, JoinType::Inner).expect("inner");
        assert_eq!(inner.index.labels(), vec![IndexLabel::from("c")]);
        assert_eq!(joined_pairs(&inner), vec![(Scalar::Int64(3), Scalar::Float64(0.5))]);

        let outer = join_series(&left, &right, JoinType::Outer).expect("outer");
        assert_eq!(outer.index.len(), 4);
        assert_eq!(outer.index.get(3).expect("label"), IndexLabel::from("d"));
        assert_eq!(joined_pairs(&outer)[3], (Scalar::Null, Scalar::Float64(1.5)));
    }
}
