//! Scalar type system and the `Variant` tagged value (C1).

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use smol_str::SmolStr;

use crate::error::{Error, Result};

/// The eight logical scalar types. `None` is the untyped null marker used
/// only for literal `NULL` before it has been typed against a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Type {
    None,
    Boolean,
    Int,
    Real,
    String,
    Date,
    Time,
    Timestamp,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Type::None => "NONE",
            Type::Boolean => "BOOLEAN",
            Type::Int => "INTEGER",
            Type::Real => "REAL",
            Type::String => "VARCHAR",
            Type::Date => "DATE",
            Type::Time => "TIME",
            Type::Timestamp => "TIMESTAMP",
        };
        f.write_str(s)
    }
}

impl Type {
    pub fn parse_name(name: &str) -> Option<Type> {
        let ty = match name.to_ascii_uppercase().as_str() {
            "BOOLEAN" | "BOOL" => Type::Boolean,
            "INTEGER" | "INT" | "BIGINT" => Type::Int,
            "REAL" | "DOUBLE" | "FLOAT" => Type::Real,
            "VARCHAR" | "STRING" | "CHAR" | "CHARACTER" => Type::String,
            "DATE" => Type::Date,
            "TIME" => Type::Time,
            "TIMESTAMP" => Type::Timestamp,
            _ => return None,
        };
        Some(ty)
    }
}

/// A tagged scalar value with SQL null semantics: nullness is orthogonal to
/// type, so `Variant::null(Type::Int)` and `Variant::null(Type::String)` are
/// distinct values.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Variant {
    None,
    Boolean(Option<bool>),
    Int(Option<i64>),
    Real(Option<f64>),
    String(Option<SmolStr>),
    Date(Option<NaiveDate>),
    Time(Option<NaiveTime>),
    Timestamp(Option<NaiveDateTime>),
}

impl Variant {
    pub fn null(ty: Type) -> Variant {
        match ty {
            Type::None => Variant::None,
            Type::Boolean => Variant::Boolean(None),
            Type::Int => Variant::Int(None),
            Type::Real => Variant::Real(None),
            Type::String => Variant::String(None),
            Type::Date => Variant::Date(None),
            Type::Time => Variant::Time(None),
            Type::Timestamp => Variant::Timestamp(None),
        }
    }

    pub fn boolean(v: bool) -> Variant {
        Variant::Boolean(Some(v))
    }

    pub fn int(v: i64) -> Variant {
        Variant::Int(Some(v))
    }

    pub fn real(v: f64) -> Variant {
        Variant::Real(Some(v))
    }

    pub fn string(v: impl Into<SmolStr>) -> Variant {
        Variant::String(Some(v.into()))
    }

    pub fn date(v: NaiveDate) -> Variant {
        Variant::Date(Some(v))
    }

    pub fn time(v: NaiveTime) -> Variant {
        Variant::Time(Some(v))
    }

    pub fn timestamp(v: NaiveDateTime) -> Variant {
        Variant::Timestamp(Some(v))
    }

    pub fn get_type(&self) -> Type {
        match self {
            Variant::None => Type::None,
            Variant::Boolean(_) => Type::Boolean,
            Variant::Int(_) => Type::Int,
            Variant::Real(_) => Type::Real,
            Variant::String(_) => Type::String,
            Variant::Date(_) => Type::Date,
            Variant::Time(_) => Type::Time,
            Variant::Timestamp(_) => Type::Timestamp,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Variant::None => true,
            Variant::Boolean(v) => v.is_none(),
            Variant::Int(v) => v.is_none(),
            Variant::Real(v) => v.is_none(),
            Variant::String(v) => v.is_none(),
            Variant::Date(v) => v.is_none(),
            Variant::Time(v) => v.is_none(),
            Variant::Timestamp(v) => v.is_none(),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Variant::Boolean(Some(v)) => Ok(*v),
            Variant::Boolean(None) => Err(Error::exception("variant is null")),
            _ => Err(Error::exception("bad cast")),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Variant::Int(Some(v)) => Ok(*v),
            Variant::Int(None) => Err(Error::exception("variant is null")),
            _ => Err(Error::exception("bad cast")),
        }
    }

    pub fn as_real(&self) -> Result<f64> {
        match self {
            Variant::Real(Some(v)) => Ok(*v),
            Variant::Real(None) => Err(Error::exception("variant is null")),
            _ => Err(Error::exception("bad cast")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Variant::String(Some(v)) => Ok(v.as_str()),
            Variant::String(None) => Err(Error::exception("variant is null")),
            _ => Err(Error::exception("bad cast")),
        }
    }

    pub fn as_date(&self) -> Result<NaiveDate> {
        match self {
            Variant::Date(Some(v)) => Ok(*v),
            Variant::Date(None) => Err(Error::exception("variant is null")),
            _ => Err(Error::exception("bad cast")),
        }
    }

    pub fn as_time(&self) -> Result<NaiveTime> {
        match self {
            Variant::Time(Some(v)) => Ok(*v),
            Variant::Time(None) => Err(Error::exception("variant is null")),
            _ => Err(Error::exception("bad cast")),
        }
    }

    pub fn as_timestamp(&self) -> Result<NaiveDateTime> {
        match self {
            Variant::Timestamp(Some(v)) => Ok(*v),
            Variant::Timestamp(None) => Err(Error::exception("variant is null")),
            _ => Err(Error::exception("bad cast")),
        }
    }

    /// ISO 8601 for date/time types, `1|0` implied elsewhere for booleans in
    /// CSV output; this is the general-purpose renderer used by EXPLAIN and
    /// error messages. CSV row output goes through `csvsqldb_engine`'s
    /// writer, which handles the wire-format specifics of §6.
    pub fn to_display_string(&self) -> String {
        match self {
            Variant::None => String::new(),
            Variant::Boolean(None)
            | Variant::Int(None)
            | Variant::Real(None)
            | Variant::String(None)
            | Variant::Date(None)
            | Variant::Time(None)
            | Variant::Timestamp(None) => String::new(),
            Variant::Boolean(Some(v)) => if *v { "1" } else { "0" }.to_string(),
            Variant::Int(Some(v)) => v.to_string(),
            Variant::Real(Some(v)) => format!("{v:.6}"),
            Variant::String(Some(v)) => v.to_string(),
            Variant::Date(Some(v)) => v.format("%Y-%m-%d").to_string(),
            Variant::Time(Some(v)) => v.format("%H:%M:%S").to_string(),
            Variant::Timestamp(Some(v)) => v.format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }

    /// Parses a textual literal into the scalar named by `ty`. Parsing
    /// failures raise a typed error and never silently coerce.
    pub fn parse(ty: Type, text: &str) -> Result<Variant> {
        match ty {
            Type::None => Ok(Variant::None),
            Type::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Variant::boolean(true)),
                "false" | "0" => Ok(Variant::boolean(false)),
                _ => Err(Error::exception(format!("'{text}' is not a valid BOOLEAN"))),
            },
            Type::Int => text
                .trim()
                .parse::<i64>()
                .map(Variant::int)
                .map_err(|_| Error::exception(format!("'{text}' is not a valid INTEGER"))),
            Type::Real => text
                .trim()
                .parse::<f64>()
                .map(Variant::real)
                .map_err(|_| Error::exception(format!("'{text}' is not a valid REAL"))),
            Type::String => Ok(Variant::string(text)),
            Type::Date => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .map(Variant::date)
                .map_err(|_| Error::exception(format!("'{text}' is not a valid DATE"))),
            Type::Time => NaiveTime::parse_from_str(text.trim(), "%H:%M:%S")
                .map(Variant::time)
                .map_err(|_| Error::exception(format!("'{text}' is not a valid TIME"))),
            Type::Timestamp => parse_timestamp(text.trim())
                .map(Variant::timestamp)
                .map_err(|_| Error::exception(format!("'{text}' is not a valid TIMESTAMP"))),
        }
    }

    /// CAST rules: STRING->{INT,REAL,BOOLEAN,DATE,TIME,TIMESTAMP} parses the
    /// text; INT->REAL is lossless widening; REAL->INT truncates;
    /// BOOLEAN->INT maps true->1/false->0. DATE-DATE/TIME-TIME/TIMESTAMP-TIMESTAMP
    /// differencing is not a cast at all; it is handled by `sub_assign` below.
    pub fn cast(&self, ty: Type) -> Result<Variant> {
        if self.is_null() {
            return Ok(Variant::null(ty));
        }
        if self.get_type() == ty {
            return Ok(self.clone());
        }
        match (self, ty) {
            (Variant::String(Some(s)), _) => Variant::parse(ty, s),
            (Variant::Int(Some(v)), Type::Real) => Ok(Variant::real(*v as f64)),
            (Variant::Real(Some(v)), Type::Int) => Ok(Variant::int(*v as i64)),
            (Variant::Boolean(Some(v)), Type::Int) => Ok(Variant::int(if *v { 1 } else { 0 })),
            (Variant::Int(Some(v)), Type::Boolean) => Ok(Variant::boolean(*v != 0)),
            (_, Type::String) => Ok(Variant::string(self.to_display_string())),
            _ => Err(Error::exception(format!(
                "cannot cast {} to {ty}",
                self.get_type()
            ))),
        }
    }

    /// `+=` on Variant. Raises on a null operand or a non-numeric receiver;
    /// INT+REAL stays INT (truncating the double), REAL+anything stays REAL.
    pub fn add_assign(&mut self, rhs: &Variant) -> Result<()> {
        if self.is_null() || rhs.is_null() {
            return Err(Error::exception("cannot add to null"));
        }
        let rhs_num = rhs.numeric()?;
        match self {
            Variant::Int(Some(v)) => {
                *v += rhs_num as i64;
                Ok(())
            }
            Variant::Real(Some(v)) => {
                *v += rhs_num;
                Ok(())
            }
            _ => Err(Error::exception("cannot add to non numeric types")),
        }
    }

    /// `/=` on Variant. Division by a null divisor (including a literal
    /// zero, which the original engine never distinguishes from null in
    /// this message) raises the verbatim (misspelled) original error text.
    pub fn div_assign(&mut self, rhs: &Variant) -> Result<()> {
        let zero_or_null = rhs.is_null() || rhs.numeric().map(|n| n == 0.0).unwrap_or(false);
        if zero_or_null {
            return Err(Error::exception("cannot devide by null"));
        }
        let rhs_num = rhs.numeric()?;
        match self {
            Variant::Int(Some(v)) => {
                *v = (*v as f64 / rhs_num) as i64;
                Ok(())
            }
            Variant::Real(Some(v)) => {
                *v /= rhs_num;
                Ok(())
            }
            _ => Err(Error::exception("cannot add to non numeric types")),
        }
    }

    /// `-=` on Variant, mirroring `add_assign`'s null/non-numeric checks.
    /// DATE-DATE/TIME-TIME/TIMESTAMP-TIMESTAMP are special-cased here since
    /// they change the result's type to INT (days/microseconds/seconds)
    /// rather than keeping the receiver's type the way numeric subtraction
    /// does.
    pub fn sub_assign(&mut self, rhs: &Variant) -> Result<()> {
        if self.is_null() || rhs.is_null() {
            return Err(Error::exception("cannot subtract null"));
        }
        match (&*self, rhs) {
            (Variant::Date(Some(a)), Variant::Date(Some(b))) => {
                *self = Variant::int(a.signed_duration_since(*b).num_days());
                return Ok(());
            }
            (Variant::Time(Some(a)), Variant::Time(Some(b))) => {
                *self = Variant::int((*a - *b).num_microseconds().unwrap_or(0));
                return Ok(());
            }
            (Variant::Timestamp(Some(a)), Variant::Timestamp(Some(b))) => {
                *self = Variant::int(a.signed_duration_since(*b).num_seconds());
                return Ok(());
            }
            _ => {}
        }
        let rhs_num = rhs.numeric()?;
        match self {
            Variant::Int(Some(v)) => {
                *v -= rhs_num as i64;
                Ok(())
            }
            Variant::Real(Some(v)) => {
                *v -= rhs_num;
                Ok(())
            }
            _ => Err(Error::exception("cannot subtract from non numeric types")),
        }
    }

    /// `*=` on Variant, mirroring `add_assign`'s null/non-numeric checks.
    pub fn mul_assign(&mut self, rhs: &Variant) -> Result<()> {
        if self.is_null() || rhs.is_null() {
            return Err(Error::exception("cannot multiply null"));
        }
        let rhs_num = rhs.numeric()?;
        match self {
            Variant::Int(Some(v)) => {
                *v *= rhs_num as i64;
                Ok(())
            }
            Variant::Real(Some(v)) => {
                *v *= rhs_num;
                Ok(())
            }
            _ => Err(Error::exception("cannot multiply non numeric types")),
        }
    }

    /// `%=` on Variant. Shares `div_assign`'s zero-or-null treatment.
    pub fn mod_assign(&mut self, rhs: &Variant) -> Result<()> {
        let zero_or_null = rhs.is_null() || rhs.numeric().map(|n| n == 0.0).unwrap_or(false);
        if zero_or_null {
            return Err(Error::exception("cannot devide by null"));
        }
        let rhs_num = rhs.numeric()?;
        match self {
            Variant::Int(Some(v)) => {
                *v %= rhs_num as i64;
                Ok(())
            }
            Variant::Real(Some(v)) => {
                *v %= rhs_num;
                Ok(())
            }
            _ => Err(Error::exception("cannot add to non numeric types")),
        }
    }

    /// Unary minus. Null propagates; non-numeric receivers raise.
    pub fn negate(&self) -> Result<Variant> {
        match self {
            Variant::Int(None) | Variant::Real(None) => Ok(self.clone()),
            Variant::Int(Some(v)) => Ok(Variant::int(-v)),
            Variant::Real(Some(v)) => Ok(Variant::real(-v)),
            _ => Err(Error::exception("cannot negate non numeric types")),
        }
    }

    fn numeric(&self) -> Result<f64> {
        match self {
            Variant::Int(Some(v)) => Ok(*v as f64),
            Variant::Real(Some(v)) => Ok(*v),
            _ => Err(Error::exception("cannot add to non numeric types")),
        }
    }
}

fn parse_timestamp(text: &str) -> std::result::Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
}

/// Equality between variants of different types raises; a null variant
/// never equals another variant (`NULL = NULL` is false — two-valued here,
/// matching spec.md's preserved quirk; `IS [NOT] NULL` is compiled to its
/// own opcode and never routed through this).
impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        if self.get_type() != other.get_type() {
            return false;
        }
        if self.is_null() || other.is_null() {
            return false;
        }
        match (self, other) {
            (Variant::Boolean(Some(a)), Variant::Boolean(Some(b))) => a == b,
            (Variant::Int(Some(a)), Variant::Int(Some(b))) => a == b,
            (Variant::Real(Some(a)), Variant::Real(Some(b))) => a == b,
            (Variant::String(Some(a)), Variant::String(Some(b))) => a == b,
            (Variant::Date(Some(a)), Variant::Date(Some(b))) => a == b,
            (Variant::Time(Some(a)), Variant::Time(Some(b))) => a == b,
            (Variant::Timestamp(Some(a)), Variant::Timestamp(Some(b))) => a == b,
            _ => false,
        }
    }
}

impl Variant {
    /// Total ordering, used by sort and comparison opcodes. Comparing
    /// variants of different types raises, matching `eq`'s behaviour. Nulls
    /// never compare less/greater/equal to anything (three-valued
    /// comparisons resolve through the stack machine's `AND`/`OR` handling,
    /// not here).
    pub fn compare(&self, other: &Variant) -> Result<Option<Ordering>> {
        if self.get_type() != other.get_type() {
            return Err(Error::exception(format!(
                "comparing Variants with different types ({}:{})",
                self.get_type(),
                other.get_type()
            )));
        }
        if self.is_null() || other.is_null() {
            return Ok(None);
        }
        let ord = match (self, other) {
            (Variant::Boolean(Some(a)), Variant::Boolean(Some(b))) => a.cmp(b),
            (Variant::Int(Some(a)), Variant::Int(Some(b))) => a.cmp(b),
            (Variant::Real(Some(a)), Variant::Real(Some(b))) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Variant::String(Some(a)), Variant::String(Some(b))) => a.cmp(b),
            (Variant::Date(Some(a)), Variant::Date(Some(b))) => a.cmp(b),
            (Variant::Time(Some(a)), Variant::Time(Some(b))) => a.cmp(b),
            (Variant::Timestamp(Some(a)), Variant::Timestamp(Some(b))) => a.cmp(b),
            _ => unreachable!("type equality checked above"),
        };
        Ok(Some(ord))
    }

    /// Nulls sort low for ASC, matching `SortingBlockIterator`'s contract
    /// (spec.md §4.10).
    pub fn compare_nulls_low(&self, other: &Variant) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.compare(other).ok().flatten().unwrap_or(Ordering::Equal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_never_equals_null() {
        assert_ne!(Variant::Int(None), Variant::Int(None));
    }

    #[test]
    fn different_types_raise_on_compare() {
        let err = Variant::int(1).compare(&Variant::string("1")).unwrap_err();
        assert!(err.to_string().contains("different types"));
    }

    #[test]
    fn add_assign_int_real_stays_int() {
        let mut v = Variant::int(1);
        v.add_assign(&Variant::real(2.9)).unwrap();
        assert_eq!(v.as_int().unwrap(), 3);
    }

    #[test]
    fn add_assign_null_errors() {
        let mut v = Variant::Int(None);
        let err = v.add_assign(&Variant::int(1)).unwrap_err();
        assert_eq!(err.to_string(), "cannot add to null");
    }

    #[test]
    fn div_assign_by_zero_message_preserved() {
        let mut v = Variant::int(4);
        let err = v.div_assign(&Variant::int(0)).unwrap_err();
        assert_eq!(err.to_string(), "cannot devide by null");
    }

    #[test]
    fn sub_assign_date_minus_date_yields_int_days() {
        let mut v = Variant::date(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        v.sub_assign(&Variant::date(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap())).unwrap();
        assert_eq!(v.get_type(), Type::Int);
        assert_eq!(v.as_int().unwrap(), 365);
    }

    #[test]
    fn sub_assign_time_minus_time_yields_int_microseconds() {
        let mut v = Variant::time(NaiveTime::from_hms_opt(1, 0, 0).unwrap());
        v.sub_assign(&Variant::time(NaiveTime::from_hms_opt(0, 0, 0).unwrap())).unwrap();
        assert_eq!(v.get_type(), Type::Int);
        assert_eq!(v.as_int().unwrap(), 3_600_000_000);
    }

    #[test]
    fn sub_assign_timestamp_minus_timestamp_yields_int_seconds() {
        let mut v = Variant::timestamp(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(1, 0, 0).unwrap(),
        );
        v.sub_assign(&Variant::timestamp(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
        ))
        .unwrap();
        assert_eq!(v.get_type(), Type::Int);
        assert_eq!(v.as_int().unwrap(), 3_600);
    }

    #[test]
    fn cast_string_to_int() {
        let v = Variant::string("42").cast(Type::Int).unwrap();
        assert_eq!(v.as_int().unwrap(), 42);
    }

    #[test]
    fn cast_real_to_int_truncates() {
        let v = Variant::real(4.9).cast(Type::Int).unwrap();
        assert_eq!(v.as_int().unwrap(), 4);
    }

    #[test]
    fn nulls_sort_low_ascending() {
        let mut vs = vec![Variant::int(3), Variant::Int(None), Variant::int(1)];
        vs.sort_by(|a, b| a.compare_nulls_low(b));
        assert!(vs[0].is_null());
    }
}
