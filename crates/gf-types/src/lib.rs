#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of column element types. A column keeps its dtype for life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Int64,
    Float64,
    Utf8,
    Bool,
    Time,
    Category,
}

impl DType {
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64 | Self::Bool)
    }

    #[must_use]
    pub fn is_textual(self) -> bool {
        matches!(self, Self::Utf8 | Self::Category)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
            Self::Bool => "bool",
            Self::Time => "time",
            Self::Category => "category",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Time(NaiveDateTime),
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl From<NaiveDateTime> for Scalar {
    fn from(value: NaiveDateTime) -> Self {
        Self::Time(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NA"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
            Self::Time(v) => write!(f, "{}", v.format(TIME_DISPLAY_FORMAT)),
        }
    }
}

const TIME_DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

impl Scalar {
    /// Natural dtype of a non-missing value; `None` for `Null`.
    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DType::Bool),
            Self::Int64(_) => Some(DType::Int64),
            Self::Float64(_) => Some(DType::Float64),
            Self::Utf8(_) => Some(DType::Utf8),
            Self::Time(_) => Some(DType::Time),
        }
    }

    /// Float `NaN` counts as missing alongside explicit `Null`.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn coalesce(&self, other: &Self) -> Self {
        if self.is_missing() {
            other.clone()
        } else {
            self.clone()
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null => Err(TypeError::ValueIsMissing),
            Self::Utf8(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Utf8,
            }),
            Self::Time(v) => Err(TypeError::NonNumericValue {
                value: v.to_string(),
                dtype: DType::Time,
            }),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (a, b) if a.is_missing() && b.is_missing() => true,
            (Self::Int64(a), Self::Float64(b)) | (Self::Float64(b), Self::Int64(a)) => {
                (*a as f64) == *b
            }
            _ => self == other,
        }
    }

    /// Ordering between two non-missing values of compatible dtypes.
    ///
    /// Numeric values compare through `f64`; mismatched families fall back to
    /// dtype order so sorting never panics on malformed input.
    #[must_use]
    pub fn cmp_values(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Utf8(a), Self::Utf8(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (
                Self::Float64(_) | Self::Int64(_) | Self::Bool(_),
                Self::Float64(_) | Self::Int64(_) | Self::Bool(_),
            ) => {
                let lhs = self.to_f64().unwrap_or(f64::NAN);
                let rhs = other.to_f64().unwrap_or(f64::NAN);
                lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal)
            }
            _ => self.dtype().cmp(&other.dtype()),
        }
    }

    /// Borrowed hashable identity, used for grouping and join probes.
    #[must_use]
    pub fn key(&self) -> ScalarKey<'_> {
        match self {
            Self::Null => ScalarKey::Null,
            Self::Bool(v) => ScalarKey::Bool(*v),
            Self::Int64(v) => ScalarKey::Int64(*v),
            Self::Float64(v) if v.is_nan() => ScalarKey::Null,
            // -0.0 and 0.0 must land in the same bucket.
            Self::Float64(v) if *v == 0.0 => ScalarKey::FloatBits(0.0_f64.to_bits()),
            Self::Float64(v) => ScalarKey::FloatBits(v.to_bits()),
            Self::Utf8(v) => ScalarKey::Utf8(v.as_str()),
            Self::Time(v) => ScalarKey::Time(*v),
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ScalarKey<'a> {
    Null,
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
    Time(NaiveDateTime),
}

impl ScalarKey<'_> {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Kinds of failure shared by every crate in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidShape,
    ColumnNotFound,
    TypeMismatch,
    IndexOutOfBounds,
    NullValueEncountered,
    KeyNotFound,
    EmptyDataFrame,
    EmptySeries,
    DuplicateColumn,
    InvalidArgument,
    Runtime,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("dtype coercion from {left} to {right} has no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("cannot cast value {value:?} to {to}")]
    InvalidCast { value: String, to: DType },
    #[error("cannot parse {value:?} as {to}")]
    Unparseable { value: String, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("expected 0/1 for bool cast but found {value}")]
    InvalidBoolNumber { value: f64 },
    #[error("value {value:?} has non-numeric dtype {dtype}")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value {value:?} does not match column dtype {dtype}")]
    DtypeMismatch { value: String, dtype: DType },
    #[error("value is missing")]
    ValueIsMissing,
}

impl TypeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValueIsMissing => ErrorKind::NullValueEncountered,
            _ => ErrorKind::TypeMismatch,
        }
    }
}

pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Bool, Category, Float64, Int64, Utf8};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Bool, Int64) | (Int64, Bool) => Int64,
        (Bool | Int64, Float64) | (Float64, Bool | Int64) => Float64,
        (Utf8, Category) | (Category, Utf8) => Utf8,
        _ => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

/// Common dtype of all non-missing values; `None` when every value is missing.
pub fn infer_dtype(values: &[Scalar]) -> Result<Option<DType>, TypeError> {
    let mut current: Option<DType> = None;
    for value in values {
        if value.is_missing() {
            continue;
        }
        let Some(dtype) = value.dtype() else {
            continue;
        };
        current = Some(match current {
            None => dtype,
            Some(prev) => common_dtype(prev, dtype)?,
        });
    }
    Ok(current)
}

/// Parse a timestamp from the textual forms accepted by `astype(Time)`.
pub fn parse_time(text: &str) -> Result<NaiveDateTime, TypeError> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed);
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight);
    }
    Err(TypeError::Unparseable {
        value: text.to_owned(),
        to: DType::Time,
    })
}

/// Nanoseconds since the Unix epoch; `None` outside the representable range.
#[must_use]
pub fn time_to_nanos(value: &NaiveDateTime) -> Option<i64> {
    value.and_utc().timestamp_nanos_opt()
}

#[must_use]
pub fn time_from_nanos(nanos: i64) -> NaiveDateTime {
    DateTime::from_timestamp_nanos(nanos).naive_utc()
}

fn lossless_float_to_int(value: f64) -> Result<i64, TypeError> {
    if !value.is_finite() || value != value.trunc() {
        return Err(TypeError::LossyFloatToInt { value });
    }
    if value < i64::MIN as f64 || value > i64::MAX as f64 {
        return Err(TypeError::LossyFloatToInt { value });
    }
    Ok(value as i64)
}

fn invalid_cast(value: &Scalar, to: DType) -> TypeError {
    TypeError::InvalidCast {
        value: value.to_string(),
        to,
    }
}

/// Convert a scalar into the representation of `target`.
///
/// Missing values stay missing and never attempt conversion. Identity casts
/// hand the value back without cloning.
pub fn cast_scalar_owned(value: Scalar, target: DType) -> Result<Scalar, TypeError> {
    if value.is_missing() {
        return Ok(Scalar::Null);
    }

    match target {
        DType::Int64 => match value {
            Scalar::Int64(_) => Ok(value),
            Scalar::Bool(v) => Ok(Scalar::Int64(i64::from(v))),
            Scalar::Float64(v) => lossless_float_to_int(v).map(Scalar::Int64),
            Scalar::Utf8(ref text) => {
                let trimmed = text.trim();
                if let Ok(v) = trimmed.parse::<i64>() {
                    return Ok(Scalar::Int64(v));
                }
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(|v| lossless_float_to_int(v).ok())
                    .map(Scalar::Int64)
                    .ok_or_else(|| TypeError::Unparseable {
                        value: text.clone(),
                        to: target,
                    })
            }
            Scalar::Time(ref v) => time_to_nanos(v)
                .map(Scalar::Int64)
                .ok_or_else(|| invalid_cast(&value, target)),
            Scalar::Null => Ok(Scalar::Null),
        },
        DType::Float64 => match value {
            Scalar::Float64(_) => Ok(value),
            Scalar::Bool(v) => Ok(Scalar::Float64(if v { 1.0 } else { 0.0 })),
            Scalar::Int64(v) => Ok(Scalar::Float64(v as f64)),
            Scalar::Utf8(ref text) => text
                .trim()
                .parse::<f64>()
                .map(Scalar::Float64)
                .map_err(|_| TypeError::Unparseable {
                    value: text.clone(),
                    to: target,
                }),
            Scalar::Time(_) => Err(invalid_cast(&value, target)),
            Scalar::Null => Ok(Scalar::Null),
        },
        DType::Bool => match value {
            Scalar::Bool(_) => Ok(value),
            Scalar::Int64(v) => match v {
                0 => Ok(Scalar::Bool(false)),
                1 => Ok(Scalar::Bool(true)),
                _ => Err(TypeError::InvalidBoolNumber { value: v as f64 }),
            },
            Scalar::Float64(v) => {
                if v == 0.0 {
                    Ok(Scalar::Bool(false))
                } else if v == 1.0 {
                    Ok(Scalar::Bool(true))
                } else {
                    Err(TypeError::InvalidBoolNumber { value: v })
                }
            }
            Scalar::Utf8(ref text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Scalar::Bool(true)),
                "false" => Ok(Scalar::Bool(false)),
                _ => Err(TypeError::Unparseable {
                    value: text.clone(),
                    to: target,
                }),
            },
            Scalar::Time(_) => Err(invalid_cast(&value, target)),
            Scalar::Null => Ok(Scalar::Null),
        },
        DType::Utf8 | DType::Category => match value {
            Scalar::Utf8(_) => Ok(value),
            other => Ok(Scalar::Utf8(other.to_string())),
        },
        DType::Time => match value {
            Scalar::Time(_) => Ok(value),
            Scalar::Utf8(ref text) => parse_time(text).map(Scalar::Time),
            Scalar::Int64(v) => Ok(Scalar::Time(time_from_nanos(v))),
            _ => Err(invalid_cast(&value, target)),
        },
    }
}

pub fn cast_scalar(value: &Scalar, target: DType) -> Result<Scalar, TypeError> {
    cast_scalar_owned(value.clone(), target)
}

/// Check that a non-missing value already has the storage shape of `dtype`.
pub fn check_scalar_dtype(value: &Scalar, dtype: DType) -> Result<(), TypeError> {
    let matches = match (value, dtype) {
        (Scalar::Null, _) => true,
        (Scalar::Bool(_), DType::Bool)
        | (Scalar::Int64(_), DType::Int64)
        | (Scalar::Float64(_), DType::Float64)
        | (Scalar::Utf8(_), DType::Utf8 | DType::Category)
        | (Scalar::Time(_), DType::Time) => true,
        _ => false,
    };
    if matches {
        Ok(())
    } else {
        Err(TypeError::DtypeMismatch {
            value: value.to_string(),
            dtype,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{
        DType, ErrorKind, Scalar, TypeError, cast_scalar, common_dtype, infer_dtype, parse_time,
        time_from_nanos, time_to_nanos,
    };

    #[test]
    fn dtype_inference_coerces_numeric_values() {
        let values = vec![Scalar::Bool(true), Scalar::Int64(7), Scalar::Float64(3.5)];
        assert_eq!(
            infer_dtype(&values).expect("dtype should infer"),
            Some(DType::Float64)
        );
    }

    #[test]
    fn dtype_inference_skips_missing_values() {
        let values = vec![Scalar::Null, Scalar::Int64(1), Scalar::Float64(f64::NAN)];
        assert_eq!(infer_dtype(&values).expect("infer"), Some(DType::Int64));
        assert_eq!(infer_dtype(&[Scalar::Null]).expect("infer"), None);
    }

    #[test]
    fn common_dtype_rejects_string_numeric_mix() {
        let err = common_dtype(DType::Utf8, DType::Int64).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "dtype coercion from utf8 to int64 has no compatible common type"
        );
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn missing_values_pass_through_casts() {
        let cast = cast_scalar(&Scalar::Null, DType::Float64).expect("missing casts");
        assert_eq!(cast, Scalar::Null);
        let cast = cast_scalar(&Scalar::Float64(f64::NAN), DType::Int64).expect("nan casts");
        assert_eq!(cast, Scalar::Null);
    }

    #[test]
    fn non_numeric_string_fails_float_cast() {
        let err = cast_scalar(&Scalar::from("abc"), DType::Float64).expect_err("must fail");
        assert!(matches!(err, TypeError::Unparseable { .. }));
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn numeric_strings_parse() {
        assert_eq!(
            cast_scalar(&Scalar::from(" 42 "), DType::Int64).expect("int"),
            Scalar::Int64(42)
        );
        assert_eq!(
            cast_scalar(&Scalar::from("2.5"), DType::Float64).expect("float"),
            Scalar::Float64(2.5)
        );
        assert_eq!(
            cast_scalar(&Scalar::from("TRUE"), DType::Bool).expect("bool"),
            Scalar::Bool(true)
        );
    }

    #[test]
    fn lossy_float_to_int_is_rejected() {
        let err = cast_scalar(&Scalar::Float64(1.5), DType::Int64).expect_err("lossy");
        assert_eq!(err, TypeError::LossyFloatToInt { value: 1.5 });
    }

    #[test]
    fn time_parses_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .expect("valid date");
        assert_eq!(parse_time("2024-03-01 12:30:00").expect("space"), expected);
        assert_eq!(parse_time("2024-03-01T12:30:00").expect("iso"), expected);
        assert_eq!(parse_time("2024-03-01T12:30:00Z").expect("rfc3339"), expected);
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn time_nanos_round_trip() {
        let ts = parse_time("2021-06-15").expect("date");
        let nanos = time_to_nanos(&ts).expect("in range");
        assert_eq!(time_from_nanos(nanos), ts);
    }

    #[test]
    fn category_and_utf8_share_textual_storage() {
        assert_eq!(
            common_dtype(DType::Category, DType::Utf8).expect("textual"),
            DType::Utf8
        );
        assert_eq!(
            cast_scalar(&Scalar::Int64(7), DType::Category).expect("format"),
            Scalar::from("7")
        );
    }

    #[test]
    fn keys_unify_signed_zero_and_nan() {
        assert_eq!(Scalar::Float64(-0.0).key(), Scalar::Float64(0.0).key());
        assert!(Scalar::Float64(f64::NAN).key().is_null());
    }

    #[test]
    fn semantic_eq_crosses_numeric_dtypes() {
        assert!(Scalar::Int64(2).semantic_eq(&Scalar::Float64(2.0)));
        assert!(Scalar::Null.semantic_eq(&Scalar::Float64(f64::NAN)));
        assert!(!Scalar::Int64(2).semantic_eq(&Scalar::from("2")));
    }
}
