#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gf_columnar::{Column, ColumnError};
use gf_frame::{DataFrame, FrameError, Series};
use gf_index::{Index, IndexLabel};
use gf_runtime::{ExecutionOptions, RuntimeError, parallel_map};
use gf_types::{DType, ErrorKind, Scalar, ScalarKey};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupByOptions {
    /// Exclude rows whose key tuple holds a null. When `false`, such rows
    /// form their own groups in first-seen order.
    pub dropna: bool,
}

impl Default for GroupByOptions {
    fn default() -> Self {
        Self { dropna: true }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupByError {
    #[error("group by requires at least one key column")]
    NoKeys,
    #[error("unknown aggregation {name:?}")]
    UnknownAggregation { name: String },
    #[error("aggregation {aggregator} failed on column {column:?}: {source}")]
    Aggregate {
        column: String,
        aggregator: String,
        #[source]
        source: ColumnError,
    },
    #[error("keys and values differ in length: {keys} vs {values}")]
    LengthMismatch { keys: usize, values: usize },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl GroupByError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoKeys | Self::UnknownAggregation { .. } => ErrorKind::InvalidArgument,
            Self::LengthMismatch { .. } => ErrorKind::InvalidShape,
            Self::Aggregate { source, .. } | Self::Column(source) => source.kind(),
            Self::Frame(err) => err.kind(),
            Self::Runtime(err) => err.kind(),
        }
    }
}

// ── Aggregators ────────────────────────────────────────────────────────

/// Reducer applied to one group of one column.
///
/// `values` never contains nulls and is never empty; groups whose values
/// are all null produce [`Aggregator::empty_value`] without a call.
pub trait Aggregator: Send + Sync {
    fn name(&self) -> &str;

    fn aggregate(&self, values: &Column) -> Result<Scalar, ColumnError>;

    fn empty_value(&self) -> Scalar {
        Scalar::Null
    }

    /// Output dtype for an input column of `input`; `None` infers it from
    /// the produced values.
    fn output_dtype(&self, _input: DType) -> Option<DType> {
        None
    }
}

/// Built-in aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunc {
    Sum,
    Mean,
    Count,
    Min,
    Max,
    First,
    Last,
    Std,
    Var,
    Median,
}

impl AggFunc {
    pub const ALL: [Self; 10] = [
        Self::Sum,
        Self::Mean,
        Self::Count,
        Self::Min,
        Self::Max,
        Self::First,
        Self::Last,
        Self::Std,
        Self::Var,
        Self::Median,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::First => "first",
            Self::Last => "last",
            Self::Std => "std",
            Self::Var => "var",
            Self::Median => "median",
        }
    }

    /// Parse a lowercase aggregation name such as `"mean"`.
    pub fn from_name(name: &str) -> Result<Self, GroupByError> {
        Self::ALL
            .into_iter()
            .find(|func| func.as_str() == name)
            .ok_or_else(|| GroupByError::UnknownAggregation {
                name: name.to_owned(),
            })
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Aggregator for AggFunc {
    fn name(&self) -> &str {
        self.as_str()
    }

    fn aggregate(&self, values: &Column) -> Result<Scalar, ColumnError> {
        match self {
            Self::Sum => values.sum(),
            Self::Mean => values.mean(),
            Self::Count => Ok(Scalar::Int64(values.count() as i64)),
            Self::Min => Ok(values.min()),
            Self::Max => Ok(values.max()),
            Self::First => Ok(values.first_valid()),
            Self::Last => Ok(values.last_valid()),
            Self::Std => values.std(),
            Self::Var => values.var(),
            Self::Median => values.median(),
        }
    }

    fn output_dtype(&self, input: DType) -> Option<DType> {
        Some(match self {
            Self::Count => DType::Int64,
            Self::Sum if matches!(input, DType::Int64 | DType::Bool) => DType::Int64,
            Self::Min | Self::Max | Self::First | Self::Last => input,
            Self::Sum | Self::Mean | Self::Std | Self::Var | Self::Median => DType::Float64,
        })
    }
}

/// One requested output column: `aggregator` applied to `column`.
#[derive(Clone)]
pub struct AggSpec {
    column: String,
    output: String,
    aggregator: Arc<dyn Aggregator>,
}

impl fmt::Debug for AggSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggSpec")
            .field("column", &self.column)
            .field("output", &self.output)
            .field("aggregator", &self.aggregator.name())
            .finish()
    }
}

impl AggSpec {
    /// Output column named after the input column.
    #[must_use]
    pub fn new(column: impl Into<String>, func: AggFunc) -> Self {
        Self::custom(column, Arc::new(func))
    }

    #[must_use]
    pub fn custom(column: impl Into<String>, aggregator: Arc<dyn Aggregator>) -> Self {
        let column = column.into();
        Self {
            output: column.clone(),
            column,
            aggregator,
        }
    }

    #[must_use]
    pub fn alias(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    #[must_use]
    pub fn column(&self) -> &str {
        &self.column
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }
}

// ── Grouping ───────────────────────────────────────────────────────────

/// A distinct key tuple and the row positions carrying it, in row order.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: Vec<Scalar>,
    pub positions: Vec<usize>,
}

/// Row partition of a frame by one or more key columns.
///
/// Groups appear in the order their key tuple is first seen.
#[derive(Debug, Clone)]
pub struct GroupBy<'a> {
    frame: &'a DataFrame,
    keys: Vec<String>,
    groups: Vec<Group>,
}

fn partition(key_columns: &[&Column], rows: usize, dropna: bool) -> Vec<Group> {
    let mut slots: HashMap<Vec<ScalarKey<'_>>, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for pos in 0..rows {
        let tuple: Vec<ScalarKey<'_>> = key_columns.iter().map(|col| col.key_at(pos)).collect();
        if dropna && tuple.iter().any(ScalarKey::is_null) {
            continue;
        }
        let slot = *slots.entry(tuple).or_insert_with(|| {
            groups.push(Group {
                key: key_columns.iter().map(|col| col.scalar(pos)).collect(),
                positions: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].positions.push(pos);
    }
    groups
}

/// Index over the group keys, or `0..n` when some key cannot be a label
/// (null or float keys).
fn key_index(groups: &[Group]) -> Index {
    let labels: Option<Vec<IndexLabel>> = groups
        .iter()
        .map(|group| {
            let parts = group
                .key
                .iter()
                .map(|value| IndexLabel::from_scalar(value).ok().flatten())
                .collect::<Option<Vec<_>>>()?;
            Some(match <[IndexLabel; 1]>::try_from(parts) {
                Ok([single]) => single,
                Err(parts) => IndexLabel::Tuple(parts),
            })
        })
        .collect();
    labels.map_or_else(|| Index::range(groups.len()), Index::from_labels)
}

impl<'a> GroupBy<'a> {
    #[instrument(name = "groupby::partition", level = "trace", skip_all, fields(rows = frame.nrows()))]
    pub fn new(frame: &'a DataFrame, keys: &[&str], options: GroupByOptions) -> Result<Self, GroupByError> {
        if keys.is_empty() {
            return Err(GroupByError::NoKeys);
        }
        let key_columns = keys
            .iter()
            .map(|name| Ok(frame.column(name)?.column()))
            .collect::<Result<Vec<&Column>, FrameError>>()?;
        let groups = partition(&key_columns, frame.nrows(), options.dropna);
        debug!(groups = groups.len(), keys = keys.len(), "rows partitioned");
        Ok(Self {
            frame,
            keys: keys.iter().map(|&k| k.to_owned()).collect(),
            groups,
        })
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[must_use]
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    #[must_use]
    pub fn ngroups(&self) -> usize {
        self.groups.len()
    }

    /// Positions of the group whose key tuple equals `key`.
    #[must_use]
    pub fn positions_of(&self, key: &[Scalar]) -> Option<&[usize]> {
        self.groups
            .iter()
            .find(|group| {
                group.key.len() == key.len()
                    && group.key.iter().zip(key).all(|(a, b)| a.key() == b.key())
            })
            .map(|group| group.positions.as_slice())
    }

    /// Key columns followed by a `size` column with each group's row count.
    pub fn size(&self) -> Result<DataFrame, GroupByError> {
        let counts = self.groups.iter().map(|g| g.positions.len() as i64).collect();
        let mut out = self.key_frame()?;
        out.insert_column("size", Column::from_i64(counts))?;
        Ok(out)
    }

    fn key_frame(&self) -> Result<DataFrame, GroupByError> {
        let firsts: Vec<usize> = self.groups.iter().map(|g| g.positions[0]).collect();
        let names: Vec<&str> = self.keys.iter().map(String::as_str).collect();
        let frame = self
            .frame
            .select(&names)?
            .take(&firsts)?
            .with_index(key_index(&self.groups))?;
        Ok(frame)
    }

    /// Aggregate `(column, function)` pairs with default execution options.
    pub fn agg(&self, specs: &[(&str, AggFunc)]) -> Result<DataFrame, GroupByError> {
        let specs: Vec<AggSpec> = specs.iter().map(|&(col, func)| AggSpec::new(col, func)).collect();
        self.agg_with(&specs, &ExecutionOptions::default())
    }

    /// Aggregate `(column, aggregator name)` pairs such as `("score", "mean")`.
    pub fn agg_by_name(&self, specs: &[(&str, &str)]) -> Result<DataFrame, GroupByError> {
        let specs = specs
            .iter()
            .map(|&(col, name)| Ok(AggSpec::new(col, AggFunc::from_name(name)?)))
            .collect::<Result<Vec<_>, GroupByError>>()?;
        self.agg_with(&specs, &ExecutionOptions::default())
    }

    /// One output row per group in first-seen order: the key columns, then
    /// one column per spec. The result index is built from the key tuples.
    #[instrument(name = "groupby::agg", level = "trace", skip_all, fields(groups = self.groups.len(), specs = specs.len()))]
    pub fn agg_with(&self, specs: &[AggSpec], options: &ExecutionOptions) -> Result<DataFrame, GroupByError> {
        let mut out = self.key_frame()?;
        let pool = options.pool_for(self.frame.nrows())?;
        let positions: Arc<Vec<Vec<usize>>> =
            Arc::new(self.groups.iter().map(|g| g.positions.clone()).collect());
        for spec in specs {
            let source = self.frame.column(&spec.column)?.column().clone();
            let input_dtype = source.dtype();
            let aggregator = Arc::clone(&spec.aggregator);
            let groups = Arc::clone(&positions);
            let reduce_group = move |g: usize| -> Result<Scalar, ColumnError> {
                let valid: Vec<usize> = groups[g]
                    .iter()
                    .copied()
                    .filter(|&pos| !source.is_null(pos))
                    .collect();
                if valid.is_empty() {
                    return Ok(aggregator.empty_value());
                }
                aggregator.aggregate(&source.take(&valid)?)
            };
            let results = match pool {
                Some(pool) => parallel_map(pool, self.groups.len(), reduce_group)?,
                None => (0..self.groups.len()).map(reduce_group).collect(),
            };
            let wrap = |source: ColumnError| GroupByError::Aggregate {
                column: spec.column.clone(),
                aggregator: spec.aggregator.name().to_owned(),
                source,
            };
            let values = results.into_iter().collect::<Result<Vec<Scalar>, _>>().map_err(wrap)?;
            let column = match spec.aggregator.output_dtype(input_dtype) {
                Some(dtype) => Column::new(dtype, values),
                None => Column::from_values(values),
            }
            .map_err(wrap)?;
            out.insert_column(spec.output.clone(), column)?;
        }
        debug!(groups = self.groups.len(), parallel = pool.is_some(), "aggregation finished");
        Ok(out)
    }
}

/// Group-by entry points on [`DataFrame`].
pub trait GroupByExt {
    fn group_by(&self, keys: &[&str]) -> Result<GroupBy<'_>, GroupByError>;

    fn group_by_with(&self, keys: &[&str], options: GroupByOptions) -> Result<GroupBy<'_>, GroupByError>;
}

impl GroupByExt for DataFrame {
    fn group_by(&self, keys: &[&str]) -> Result<GroupBy<'_>, GroupByError> {
        GroupBy::new(self, keys, GroupByOptions::default())
    }

    fn group_by_with(&self, keys: &[&str], options: GroupByOptions) -> Result<GroupBy<'_>, GroupByError> {
        GroupBy::new(self, keys, options)
    }
}

/// Aggregate `values` grouped by the positionally aligned `keys`. The result
/// is named after the function and indexed by the key values.
pub fn groupby_agg(
    keys: &Series,
    values: &Series,
    func: AggFunc,
    options: GroupByOptions,
) -> Result<Series, GroupByError> {
    if keys.len() != values.len() {
        return Err(GroupByError::LengthMismatch {
            keys: keys.len(),
            values: values.len(),
        });
    }
    let value_name = if values.name() == keys.name() {
        format!("{}_values", values.name())
    } else {
        values.name().to_owned()
    };
    let frame = DataFrame::from_series(vec![keys.clone(), values.rename(value_name.clone())])?;
    let spec = AggSpec::new(value_name, func).alias(func.as_str());
    let out = GroupBy::new(&frame, &[keys.name()], options)?.agg_with(&[spec], &ExecutionOptions::default())?;
    Ok(out.column(func.as_str())?.clone())
}

pub fn groupby_sum(keys: &Series, values: &Series, options: GroupByOptions) -> Result<Series, GroupByError> {
    groupby_agg(keys, values, AggFunc::Sum, options)
}

pub fn groupby_mean(keys: &Series, values: &Series, options: GroupByOptions) -> Result<Series, GroupByError> {
    groupby_agg(keys, values, AggFunc::Mean, options)
}

pub fn groupby_count(keys: &Series, values: &Series, options: GroupByOptions) -> Result<Series, GroupByError> {
    groupby_agg(keys, values, AggFunc::Count, options)
}
