//! Scalar & aggregate function registry (C9).
//!
//! Grounded on `original_source/csvsqldb/buildin_functions.cpp`/`.h` for the
//! function catalog and signatures; exposed to `csvsqldb_core`'s validator
//! and parser through the `FunctionSignatures` trait so neither crate needs
//! to know about the other's concrete types.

use std::fmt;

use chrono::{Datelike, Timelike};
use csvsqldb_core::symbol::FunctionSignatures;
use csvsqldb_core::value::{Type, Variant};
use csvsqldb_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionInfo {
    pub name: &'static str,
    pub kind: FunctionKind,
    pub min_arity: usize,
    pub max_arity: usize,
}

const SCALAR_FUNCTIONS: &[&str] = &[
    "CURRENT_DATE",
    "CURRENT_TIME",
    "CURRENT_TIMESTAMP",
    "EXTRACT",
    "DATE_FORMAT",
    "TIME_FORMAT",
    "TIMESTAMP_FORMAT",
    "DATE_TRUNC",
    "POW",
    "UPPER",
    "LOWER",
    "CHARACTER_LENGTH",
    "CHAR_LENGTH",
    "VERSION",
];

const AGGREGATE_FUNCTIONS: &[&str] = &["SUM", "COUNT", "AVG", "MIN", "MAX", "ARBITRARY"];

/// A registry over the fixed built-in function set. There is no mechanism to
/// add user-defined functions, matching spec.md's closed function surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct FunctionRegistry;

impl FunctionRegistry {
    pub fn new() -> FunctionRegistry {
        FunctionRegistry
    }

    pub fn info(&self, name: &str) -> Option<FunctionInfo> {
        let upper = name.to_ascii_uppercase();
        if SCALAR_FUNCTIONS.contains(&upper.as_str()) {
            return Some(FunctionInfo {
                name: SCALAR_FUNCTIONS.iter().find(|n| **n == upper).unwrap(),
                kind: FunctionKind::Scalar,
                min_arity: scalar_min_arity(&upper),
                max_arity: scalar_max_arity(&upper),
            });
        }
        if AGGREGATE_FUNCTIONS.contains(&upper.as_str()) {
            return Some(FunctionInfo {
                name: AGGREGATE_FUNCTIONS.iter().find(|n| **n == upper).unwrap(),
                kind: FunctionKind::Aggregate,
                min_arity: 1,
                max_arity: 1,
            });
        }
        None
    }

    pub fn all(&self) -> impl Iterator<Item = FunctionInfo> + '_ {
        SCALAR_FUNCTIONS
            .iter()
            .chain(AGGREGATE_FUNCTIONS.iter())
            .map(|n| self.info(n).unwrap())
    }

    /// Dispatches a scalar call. `COUNT(*)` and other aggregate names are
    /// never dispatched here — they are compiled to `GroupingBlockIterator`
    /// accumulators instead (see `stack_machine.rs`'s `Opcode::Func`).
    pub fn call_scalar(&self, name: &str, args: &[Variant]) -> Result<Variant> {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "CURRENT_DATE" => Ok(Variant::date(chrono::Local::now().date_naive())),
            "CURRENT_TIME" => Ok(Variant::time(chrono::Local::now().time())),
            "CURRENT_TIMESTAMP" => Ok(Variant::timestamp(chrono::Local::now().naive_local())),
            "VERSION" => Ok(Variant::string("csvsqldb-rs 0.1")),
            "UPPER" => {
                let s = arg_str(&upper, args, 0)?;
                Ok(s.map(|s| Variant::string(s.to_uppercase())).unwrap_or(Variant::String(None)))
            }
            "LOWER" => {
                let s = arg_str(&upper, args, 0)?;
                Ok(s.map(|s| Variant::string(s.to_lowercase())).unwrap_or(Variant::String(None)))
            }
            "CHARACTER_LENGTH" | "CHAR_LENGTH" => {
                let s = arg_str(&upper, args, 0)?;
                Ok(s.map(|s| Variant::int(s.chars().count() as i64))
                    .unwrap_or(Variant::Int(None)))
            }
            "POW" => {
                let base = arg_real(&upper, args, 0)?;
                let exp = arg_real(&upper, args, 1)?;
                match (base, exp) {
                    (Some(b), Some(e)) => Ok(Variant::real(b.powf(e))),
                    _ => Ok(Variant::Real(None)),
                }
            }
            "EXTRACT" => extract_field(args),
            "DATE_FORMAT" => format_temporal(args, |d: chrono::NaiveDate, fmt| d.format(fmt).to_string()),
            "TIME_FORMAT" => format_temporal(args, |t: chrono::NaiveTime, fmt| t.format(fmt).to_string()),
            "TIMESTAMP_FORMAT" => {
                format_temporal(args, |ts: chrono::NaiveDateTime, fmt| ts.format(fmt).to_string())
            }
            "DATE_TRUNC" => date_trunc(args),
            _ => Err(Error::sql(format!("function '{name}' not found"))),
        }
    }

    pub fn make_aggregate(&self, name: &str, arg_type: Type) -> Result<Box<dyn Aggregate>> {
        match name.to_ascii_uppercase().as_str() {
            "SUM" => Ok(Box::new(SumAggregate::new(arg_type))),
            "COUNT" => Ok(Box::new(CountAggregate::new(false))),
            "COUNT_STAR" => Ok(Box::new(CountAggregate::new(true))),
            "AVG" => Ok(Box::new(AvgAggregate::default())),
            "MIN" => Ok(Box::new(MinMaxAggregate::new(true))),
            "MAX" => Ok(Box::new(MinMaxAggregate::new(false))),
            "ARBITRARY" => Ok(Box::new(ArbitraryAggregate::default())),
            other => Err(Error::sql(format!("function '{other}' not found"))),
        }
    }
}

impl FunctionSignatures for FunctionRegistry {
    fn return_type(&self, name: &str, arg_types: &[Type]) -> Option<Type> {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "CURRENT_DATE" => Some(Type::Date),
            "CURRENT_TIME" => Some(Type::Time),
            "CURRENT_TIMESTAMP" => Some(Type::Timestamp),
            "VERSION" | "UPPER" | "LOWER" | "DATE_FORMAT" | "TIME_FORMAT" | "TIMESTAMP_FORMAT" => {
                Some(Type::String)
            }
            "CHARACTER_LENGTH" | "CHAR_LENGTH" | "EXTRACT" => Some(Type::Int),
            "POW" => Some(Type::Real),
            "DATE_TRUNC" => Some(Type::Date),
            "SUM" | "MIN" | "MAX" | "ARBITRARY" => arg_types.first().copied(),
            "COUNT" => Some(Type::Int),
            "AVG" => Some(Type::Real),
            _ => None,
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.info(name).is_some()
    }
}

fn scalar_min_arity(name: &str) -> usize {
    match name {
        "CURRENT_DATE" | "CURRENT_TIME" | "CURRENT_TIMESTAMP" | "VERSION" => 0,
        "EXTRACT" | "POW" | "DATE_FORMAT" | "TIME_FORMAT" | "TIMESTAMP_FORMAT" | "DATE_TRUNC" => 2,
        _ => 1,
    }
}

fn scalar_max_arity(name: &str) -> usize {
    scalar_min_arity(name).max(1)
}

fn arg_str<'a>(name: &str, args: &'a [Variant], idx: usize) -> Result<Option<&'a str>> {
    let v = args
        .get(idx)
        .ok_or_else(|| Error::sql(format!("calling function '{name}' with wrong parameter")))?;
    if v.is_null() {
        return Ok(None);
    }
    v.as_str()
        .map(Some)
        .map_err(|_| Error::sql(format!("calling function '{name}' with wrong parameter")))
}

fn arg_real(name: &str, args: &[Variant], idx: usize) -> Result<Option<f64>> {
    let v = args
        .get(idx)
        .ok_or_else(|| Error::sql(format!("calling function '{name}' with wrong parameter")))?;
    if v.is_null() {
        return Ok(None);
    }
    match v {
        Variant::Real(Some(r)) => Ok(Some(*r)),
        Variant::Int(Some(i)) => Ok(Some(*i as f64)),
        _ => Err(Error::sql(format!("calling function '{name}' with wrong parameter"))),
    }
}

fn extract_field(args: &[Variant]) -> Result<Variant> {
    let field = arg_str("EXTRACT", args, 0)?.unwrap_or_default().to_ascii_uppercase();
    let value = args
        .get(1)
        .ok_or_else(|| Error::sql("calling function 'EXTRACT' with wrong parameter"))?;
    if value.is_null() {
        return Ok(Variant::Int(None));
    }
    let n = match value {
        Variant::Date(Some(d)) => match field.as_str() {
            "YEAR" => d.year() as i64,
            "MONTH" => d.month() as i64,
            "DAY" => d.day() as i64,
            _ => return Err(Error::sql("calling function 'EXTRACT' with wrong parameter")),
        },
        Variant::Time(Some(t)) => match field.as_str() {
            "HOUR" => t.hour() as i64,
            "MINUTE" => t.minute() as i64,
            "SECOND" => t.second() as i64,
            _ => return Err(Error::sql("calling function 'EXTRACT' with wrong parameter")),
        },
        Variant::Timestamp(Some(ts)) => match field.as_str() {
            "YEAR" => ts.year() as i64,
            "MONTH" => ts.month() as i64,
            "DAY" => ts.day() as i64,
            "HOUR" => ts.hour() as i64,
            "MINUTE" => ts.minute() as i64,
            "SECOND" => ts.second() as i64,
            _ => return Err(Error::sql("calling function 'EXTRACT' with wrong parameter")),
        },
        _ => return Err(Error::sql("calling function 'EXTRACT' with wrong parameter")),
    };
    Ok(Variant::int(n))
}

fn format_temporal<T: Copy>(
    args: &[Variant],
    render: impl Fn(T, &str) -> String,
) -> Result<Variant>
where
    Variant: ExtractTemporal<T>,
{
    let value = args
        .first()
        .ok_or_else(|| Error::sql("calling function with wrong parameter"))?;
    let fmt = arg_str("FORMAT", args, 1)?.unwrap_or("%Y-%m-%d").to_string();
    if value.is_null() {
        return Ok(Variant::String(None));
    }
    let t = value
        .extract()
        .ok_or_else(|| Error::sql("calling function with wrong parameter"))?;
    Ok(Variant::string(render(t, &fmt)))
}

trait ExtractTemporal<T> {
    fn extract(&self) -> Option<T>;
}

impl ExtractTemporal<chrono::NaiveDate> for Variant {
    fn extract(&self) -> Option<chrono::NaiveDate> {
        match self {
            Variant::Date(Some(d)) => Some(*d),
            _ => None,
        }
    }
}

impl ExtractTemporal<chrono::NaiveTime> for Variant {
    fn extract(&self) -> Option<chrono::NaiveTime> {
        match self {
            Variant::Time(Some(t)) => Some(*t),
            _ => None,
        }
    }
}

impl ExtractTemporal<chrono::NaiveDateTime> for Variant {
    fn extract(&self) -> Option<chrono::NaiveDateTime> {
        match self {
            Variant::Timestamp(Some(ts)) => Some(*ts),
            _ => None,
        }
    }
}

fn date_trunc(args: &[Variant]) -> Result<Variant> {
    let field = arg_str("DATE_TRUNC", args, 0)?.unwrap_or_default().to_ascii_uppercase();
    let value = args
        .get(1)
        .ok_or_else(|| Error::sql("calling function 'DATE_TRUNC' with wrong parameter"))?;
    if value.is_null() {
        return Ok(Variant::Date(None));
    }
    let d = match value {
        Variant::Date(Some(d)) => *d,
        Variant::Timestamp(Some(ts)) => ts.date(),
        _ => return Err(Error::sql("calling function 'DATE_TRUNC' with wrong parameter")),
    };
    let truncated = match field.as_str() {
        "YEAR" => chrono::NaiveDate::from_ymd_opt(d.year(), 1, 1),
        "MONTH" => chrono::NaiveDate::from_ymd_opt(d.year(), d.month(), 1),
        "DAY" => Some(d),
        _ => return Err(Error::sql("calling function 'DATE_TRUNC' with wrong parameter")),
    };
    truncated
        .map(Variant::date)
        .ok_or_else(|| Error::sql("calling function 'DATE_TRUNC' with wrong parameter"))
}

/// Aggregate accumulator: `step` folds one more input value in, `finalize`
/// reads the result. Grouping carries one boxed instance per group per
/// aggregate expression.
pub trait Aggregate: fmt::Debug {
    fn step(&mut self, value: &Variant);
    fn finalize(&self) -> Variant;
}

#[derive(Debug)]
struct SumAggregate {
    ty: Type,
    acc: Option<Variant>,
}

impl SumAggregate {
    fn new(ty: Type) -> SumAggregate {
        SumAggregate { ty, acc: None }
    }
}

impl Aggregate for SumAggregate {
    fn step(&mut self, value: &Variant) {
        if value.is_null() {
            return;
        }
        match &mut self.acc {
            None => self.acc = Some(value.clone()),
            Some(acc) => {
                let _ = acc.add_assign(value);
            }
        }
    }

    fn finalize(&self) -> Variant {
        self.acc.clone().unwrap_or(Variant::null(self.ty))
    }
}

#[derive(Debug, Default)]
struct CountAggregate {
    star: bool,
    n: i64,
}

impl CountAggregate {
    fn new(star: bool) -> CountAggregate {
        CountAggregate { star, n: 0 }
    }
}

impl Aggregate for CountAggregate {
    fn step(&mut self, value: &Variant) {
        if self.star || !value.is_null() {
            self.n += 1;
        }
    }

    fn finalize(&self) -> Variant {
        Variant::int(self.n)
    }
}

#[derive(Debug, Default)]
struct AvgAggregate {
    sum: f64,
    count: i64,
}

impl Aggregate for AvgAggregate {
    fn step(&mut self, value: &Variant) {
        let n = match value {
            Variant::Int(Some(v)) => Some(*v as f64),
            Variant::Real(Some(v)) => Some(*v),
            _ => None,
        };
        if let Some(n) = n {
            self.sum += n;
            self.count += 1;
        }
    }

    fn finalize(&self) -> Variant {
        if self.count == 0 {
            Variant::Real(None)
        } else {
            Variant::real(self.sum / self.count as f64)
        }
    }
}

#[derive(Debug)]
struct MinMaxAggregate {
    want_min: bool,
    cur: Option<Variant>,
}

impl MinMaxAggregate {
    fn new(want_min: bool) -> MinMaxAggregate {
        MinMaxAggregate { want_min, cur: None }
    }
}

impl Aggregate for MinMaxAggregate {
    fn step(&mut self, value: &Variant) {
        if value.is_null() {
            return;
        }
        match &self.cur {
            None => self.cur = Some(value.clone()),
            Some(cur) => {
                if let Ok(Some(ord)) = value.compare(cur) {
                    let replace = if self.want_min {
                        ord == std::cmp::Ordering::Less
                    } else {
                        ord == std::cmp::Ordering::Greater
                    };
                    if replace {
                        self.cur = Some(value.clone());
                    }
                }
            }
        }
    }

    fn finalize(&self) -> Variant {
        self.cur.clone().unwrap_or(Variant::None)
    }
}

#[derive(Debug, Default)]
struct ArbitraryAggregate {
    cur: Option<Variant>,
}

impl Aggregate for ArbitraryAggregate {
    fn step(&mut self, value: &Variant) {
        if self.cur.is_none() && !value.is_null() {
            self.cur = Some(value.clone());
        }
    }

    fn finalize(&self) -> Variant {
        self.cur.clone().unwrap_or(Variant::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_lower_roundtrip() {
        let reg = FunctionRegistry::new();
        let out = reg.call_scalar("UPPER", &[Variant::string("abc")]).unwrap();
        assert_eq!(out.as_str().unwrap(), "ABC");
    }

    #[test]
    fn unknown_function_rejected() {
        let reg = FunctionRegistry::new();
        assert!(!reg.exists("NOPE"));
        assert!(reg.return_type("NOPE", &[]).is_none());
    }

    #[test]
    fn sum_aggregate_skips_nulls() {
        let mut agg = SumAggregate::new(Type::Int);
        agg.step(&Variant::int(2));
        agg.step(&Variant::Int(None));
        agg.step(&Variant::int(3));
        assert_eq!(agg.finalize().as_int().unwrap(), 5);
    }

    #[test]
    fn count_star_counts_nulls() {
        let mut agg = CountAggregate::new(true);
        agg.step(&Variant::Int(None));
        agg.step(&Variant::int(1));
        assert_eq!(agg.finalize().as_int().unwrap(), 2);
    }

    #[test]
    fn min_max_track_extremes() {
        let mut min = MinMaxAggregate::new(true);
        let mut max = MinMaxAggregate::new(false);
        for v in [3, 1, 2] {
            min.step(&Variant::int(v));
            max.step(&Variant::int(v));
        }
        assert_eq!(min.finalize().as_int().unwrap(), 1);
        assert_eq!(max.finalize().as_int().unwrap(), 3);
    }
}
