//! Post-fetch value normalisation applied field by field before loading.

use chrono::NaiveDate;

use crate::value::SqlValue;

pub const DEFAULT_MIN_DATE: NaiveDate = match NaiveDate::from_ymd_opt(1, 1, 1) {
    Some(d) => d,
    None => NaiveDate::MIN,
};
pub const DEFAULT_MAX_DATE: NaiveDate = match NaiveDate::from_ymd_opt(9999, 12, 31) {
    Some(d) => d,
    None => NaiveDate::MAX,
};
/// Placeholder date some source systems use instead of NULL.
pub const ALTERNATE_DEFAULT_DATE: NaiveDate = match NaiveDate::from_ymd_opt(1000, 1, 1) {
    Some(d) => d,
    None => NaiveDate::MIN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    NullDateToMax,
    NullDateToMin,
    NullOrDefaultDateToMax,
    DefaultDateToNull,
    NullString,
    /// NULL or `~` become empty.
    DefaultString,
    /// NULL, `~` or `0` become empty.
    DefaultAndZeroString,
    /// NULL or `<UNAVAIL>` become empty.
    ProviderName,
    /// NULL becomes empty, anything else is trimmed.
    EmptyString,
    /// `00000` and NULL become empty.
    DefaultHippsCode,
    NullFloat,
    NullInt,
    DefaultIntToNull,
}

fn is_placeholder_date(d: NaiveDate) -> bool {
    d == DEFAULT_MIN_DATE || d == ALTERNATE_DEFAULT_DATE || d == DEFAULT_MAX_DATE
}

impl Transform {
    pub fn apply(&self, value: SqlValue) -> SqlValue {
        use SqlValue::*;
        match self {
            Transform::NullDateToMax => match value {
                Null => Date(DEFAULT_MAX_DATE),
                v => v,
            },
            Transform::NullDateToMin => match value {
                Null => Date(DEFAULT_MIN_DATE),
                v => v,
            },
            Transform::NullOrDefaultDateToMax => match value.as_date() {
                None => Date(DEFAULT_MAX_DATE),
                Some(d) if d == DEFAULT_MIN_DATE || d == ALTERNATE_DEFAULT_DATE => Date(DEFAULT_MAX_DATE),
                Some(_) => value,
            },
            Transform::DefaultDateToNull => match value.as_date() {
                Some(d) if is_placeholder_date(d) => Null,
                _ => value,
            },
            Transform::NullString => match value {
                Null => Text(String::new()),
                v => v,
            },
            Transform::DefaultString => blank_if(value, &["~"]),
            Transform::DefaultAndZeroString => blank_if(value, &["~", "0"]),
            Transform::ProviderName => blank_if(value, &["<UNAVAIL>"]),
            Transform::DefaultHippsCode => blank_if(value, &["00000"]),
            Transform::EmptyString => match value {
                Null => Text(String::new()),
                Text(s) => Text(s.trim().to_string()),
                v => v,
            },
            Transform::NullFloat => match value {
                Null => Float(0.0),
                v => v,
            },
            Transform::NullInt => match value {
                Null => Int(0),
                v => v,
            },
            Transform::DefaultIntToNull => match value.as_i64() {
                Some(0) => Null,
                _ => value,
            },
        }
    }
}

fn blank_if(value: SqlValue, markers: &[&str]) -> SqlValue {
    match value {
        SqlValue::Null => SqlValue::Text(String::new()),
        SqlValue::Text(s) if markers.contains(&s.as_str()) => SqlValue::Text(String::new()),
        v => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_transforms() {
        assert_eq!(Transform::NullDateToMax.apply(SqlValue::Null), SqlValue::Date(DEFAULT_MAX_DATE));
        assert_eq!(Transform::NullDateToMin.apply(SqlValue::Null), SqlValue::Date(DEFAULT_MIN_DATE));
        assert_eq!(
            Transform::NullOrDefaultDateToMax.apply(SqlValue::Date(ALTERNATE_DEFAULT_DATE)),
            SqlValue::Date(DEFAULT_MAX_DATE)
        );
        assert_eq!(Transform::DefaultDateToNull.apply(SqlValue::Date(DEFAULT_MAX_DATE)), SqlValue::Null);
        let d = NaiveDate::from_ymd_opt(2023, 5, 1).unwrap();
        assert_eq!(Transform::DefaultDateToNull.apply(SqlValue::Date(d)), SqlValue::Date(d));
    }

    #[test]
    fn string_transforms() {
        assert_eq!(Transform::DefaultString.apply(SqlValue::text("~")), SqlValue::text(""));
        assert_eq!(Transform::DefaultString.apply(SqlValue::text("0")), SqlValue::text("0"));
        assert_eq!(Transform::DefaultAndZeroString.apply(SqlValue::text("0")), SqlValue::text(""));
        assert_eq!(Transform::ProviderName.apply(SqlValue::text("<UNAVAIL>")), SqlValue::text(""));
        assert_eq!(Transform::EmptyString.apply(SqlValue::text("  A1 ")), SqlValue::text("A1"));
        assert_eq!(Transform::DefaultHippsCode.apply(SqlValue::text("00000")), SqlValue::text(""));
        assert_eq!(Transform::NullString.apply(SqlValue::Null), SqlValue::text(""));
    }

    #[test]
    fn numeric_transforms() {
        assert_eq!(Transform::DefaultIntToNull.apply(SqlValue::Int(0)), SqlValue::Null);
        assert_eq!(Transform::DefaultIntToNull.apply(SqlValue::Int(7)), SqlValue::Int(7));
        assert_eq!(Transform::NullFloat.apply(SqlValue::Null), SqlValue::Float(0.0));
        assert_eq!(Transform::NullInt.apply(SqlValue::Null), SqlValue::Int(0));
    }
}
