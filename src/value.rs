//! Row values moving between the warehouse, the planner's parameters and the staged loader.
//!
//! `SqlValue` is deliberately small: the warehouse exposes integers, decimals, text, dates and
//! timestamps, and the target tables store the same. Decimals with a zero scale are read as
//! integers (surrogate keys are NUMERIC in the warehouse), everything else becomes `f64`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Text,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    pub fn text<S: Into<String>>(s: S) -> Self { SqlValue::Text(s.into()) }

    pub fn is_null(&self) -> bool { matches!(self, SqlValue::Null) }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            SqlValue::Date(d) => Some(*d),
            SqlValue::Timestamp(ts) => Some(ts.date_naive()),
            _ => None,
        }
    }

    /// Dates widen to midnight UTC so date and timestamp columns share one cursor domain.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            SqlValue::Timestamp(ts) => Some(*ts),
            SqlValue::Date(d) => d.and_hms_opt(0, 0, 0).map(|n| n.and_utc()),
            _ => None,
        }
    }

    /// SQL-style comparison: NULL compares as unknown, numbers and temporals compare across kinds.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        use SqlValue::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (a @ (Date(_) | Timestamp(_)), b @ (Date(_) | Timestamp(_))) => {
                Some(a.as_timestamp()?.cmp(&b.as_timestamp()?))
            }
            _ => None,
        }
    }

    /// Postgres rejects NUL in text columns; some warehouse strings carry them.
    pub fn strip_nul(self) -> SqlValue {
        match self {
            SqlValue::Text(s) if s.contains('\0') => SqlValue::Text(s.replace('\0', "")),
            other => other,
        }
    }

    /// Append this value as one field of a text-format COPY row.
    pub fn write_copy_text(&self, buf: &mut BytesMut) {
        match self {
            SqlValue::Null => buf.put_slice(b"\\N"),
            SqlValue::Bool(b) => buf.put_slice(if *b { b"t" } else { b"f" }),
            SqlValue::Int(i) => buf.put_slice(i.to_string().as_bytes()),
            SqlValue::Float(f) => buf.put_slice(f.to_string().as_bytes()),
            SqlValue::Text(s) => escape_copy_text(s, buf),
            SqlValue::Date(d) => buf.put_slice(d.format("%Y-%m-%d").to_string().as_bytes()),
            SqlValue::Timestamp(ts) => {
                buf.put_slice(ts.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string().as_bytes())
            }
        }
    }

    /// Decode column `idx` of a tokio-postgres row based on its declared type.
    pub fn from_pg(row: &tokio_postgres::Row, idx: usize) -> Result<SqlValue, tokio_postgres::Error> {
        let ty = row.columns()[idx].type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?.map(|v| SqlValue::Int(v as i64))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?.map(|v| SqlValue::Int(v as i64))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx)?.map(|v| SqlValue::Float(v as f64))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Float)
        } else if *ty == Type::NUMERIC {
            row.try_get::<_, Option<Decimal>>(idx)?.map(decimal_value)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<NaiveDate>>(idx)?.map(SqlValue::Date)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(idx)?.map(|v| SqlValue::Timestamp(v.and_utc()))
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(SqlValue::Timestamp)
        } else {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        };
        Ok(value.unwrap_or(SqlValue::Null))
    }
}

fn decimal_value(d: Decimal) -> SqlValue {
    if d.scale() == 0 {
        if let Some(i) = d.to_i64() {
            return SqlValue::Int(i);
        }
    }
    d.to_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null)
}

/// Escape special characters for COPY text format.
fn escape_copy_text(s: &str, buf: &mut BytesMut) {
    for c in s.chars() {
        match c {
            '\\' => buf.put_slice(b"\\\\"),
            '\t' => buf.put_slice(b"\\t"),
            '\n' => buf.put_slice(b"\\n"),
            '\r' => buf.put_slice(b"\\r"),
            '\0' => {}
            _ => {
                let mut tmp = [0u8; 4];
                buf.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::Int(i) => write!(f, "{}", i),
            SqlValue::Float(x) => write!(f, "{}", x),
            SqlValue::Text(s) => write!(f, "'{}'", s),
            SqlValue::Date(d) => write!(f, "{}", d),
            SqlValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

// Parameters are bound against whatever the server inferred for the placeholder, so each
// variant adapts to the neighbouring integer, decimal and timestamp flavours.
impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Int(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from(*i).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else if is_text(ty) {
                    i.to_string().to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            SqlValue::Float(x) => {
                if *ty == Type::FLOAT4 {
                    (*x as f32).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::try_from(*x)?.to_sql(ty, out)
                } else {
                    x.to_sql(ty, out)
                }
            }
            SqlValue::Text(s) => s.as_str().to_sql(ty, out),
            SqlValue::Date(d) => {
                if *ty == Type::TIMESTAMP || *ty == Type::TIMESTAMPTZ {
                    match SqlValue::Date(*d).as_timestamp() {
                        Some(ts) => SqlValue::Timestamp(ts).to_sql(ty, out),
                        None => Err(format!("date {} has no midnight", d).into()),
                    }
                } else {
                    d.to_sql(ty, out)
                }
            }
            SqlValue::Timestamp(ts) => {
                if *ty == Type::TIMESTAMP {
                    ts.naive_utc().to_sql(ty, out)
                } else if *ty == Type::DATE {
                    ts.date_naive().to_sql(ty, out)
                } else {
                    ts.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(ty: &Type) -> bool {
        [
            Type::BOOL,
            Type::INT2,
            Type::INT4,
            Type::INT8,
            Type::FLOAT4,
            Type::FLOAT8,
            Type::NUMERIC,
            Type::TEXT,
            Type::VARCHAR,
            Type::BPCHAR,
            Type::NAME,
            Type::UNKNOWN,
            Type::DATE,
            Type::TIMESTAMP,
            Type::TIMESTAMPTZ,
        ]
        .contains(ty)
    }

    to_sql_checked!();
}

fn is_text(ty: &Type) -> bool {
    *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME || *ty == Type::UNKNOWN
}

/// Column names shared by every row of one result set.
#[derive(Debug, PartialEq)]
pub struct RowSchema {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl RowSchema {
    pub fn new(names: Vec<String>) -> Arc<RowSchema> {
        let index = names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();
        Arc::new(RowSchema { names, index })
    }

    pub fn names(&self) -> &[String] { &self.names }
    pub fn position(&self, name: &str) -> Option<usize> { self.index.get(name).copied() }
    pub fn len(&self) -> usize { self.names.len() }
    pub fn is_empty(&self) -> bool { self.names.is_empty() }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    schema: Arc<RowSchema>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Values beyond the schema are dropped; missing trailing values are NULL.
    pub fn new(schema: Arc<RowSchema>, mut values: Vec<SqlValue>) -> Row {
        values.resize(schema.len(), SqlValue::Null);
        Row { schema, values }
    }

    pub fn schema(&self) -> &Arc<RowSchema> { &self.schema }
    pub fn values(&self) -> &[SqlValue] { &self.values }
    pub fn into_values(self) -> Vec<SqlValue> { self.values }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.schema.position(name).map(|i| &self.values[i])
    }

    pub fn set(&mut self, name: &str, value: SqlValue) -> bool {
        match self.schema.position(name) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_text_escapes_and_strips_nul() {
        let mut buf = BytesMut::new();
        SqlValue::text("a\tb\\c\n\0d").write_copy_text(&mut buf);
        assert_eq!(&buf[..], b"a\\tb\\\\c\\nd");

        let mut buf = BytesMut::new();
        SqlValue::Null.write_copy_text(&mut buf);
        assert_eq!(&buf[..], b"\\N");

        let ts = NaiveDate::from_ymd_opt(2021, 4, 19).unwrap().and_hms_opt(1, 2, 3).unwrap().and_utc();
        let mut buf = BytesMut::new();
        SqlValue::Timestamp(ts).write_copy_text(&mut buf);
        assert_eq!(&buf[..], b"2021-04-19 01:02:03.000000+00");
    }

    #[test]
    fn temporal_values_compare_across_kinds() {
        let d = SqlValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let ts = SqlValue::Timestamp(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 1).unwrap().and_utc(),
        );
        assert_eq!(d.compare(&ts), Some(Ordering::Less));
        assert_eq!(SqlValue::Int(3).compare(&SqlValue::Float(2.5)), Some(Ordering::Greater));
        assert_eq!(SqlValue::Null.compare(&SqlValue::Int(1)), None);
        assert_eq!(SqlValue::text("21000").as_i64(), Some(21000));
    }

    #[test]
    fn strip_nul_only_touches_text() {
        assert_eq!(SqlValue::text("x\0y").strip_nul(), SqlValue::text("xy"));
        assert_eq!(SqlValue::Int(0).strip_nul(), SqlValue::Int(0));
    }

    #[test]
    fn row_lookup_by_name() {
        let schema = RowSchema::new(vec!["a".into(), "b".into()]);
        let mut row = Row::new(schema, vec![SqlValue::Int(1)]);
        assert_eq!(row.get("b"), Some(&SqlValue::Null));
        assert!(row.set("b", SqlValue::text("x")));
        assert!(!row.set("c", SqlValue::Null));
        assert_eq!(row.get("b").and_then(|v| v.as_str()), Some("x"));
    }
}
