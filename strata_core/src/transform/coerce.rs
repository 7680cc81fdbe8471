//! Value coercion from raw, untyped cells.
//!
//! Each function returns `Ok(None)` for absent values (null, blank, or a null
//! token such as `nan`) and `Err(reason)` for present-but-unparseable ones.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde_json::Value;

/// Tokens spreadsheet exports use for "no value".
fn is_null_token(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "" | "nan" | "nat" | "none" | "null" | "n/a" | "-"
    )
}

fn present_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => v.to_string(),
    };
    if is_null_token(&s) {
        None
    } else {
        Some(s)
    }
}

/// Text dimension. Whole floats print without a fraction (`123.0` -> `123`).
pub fn to_text(v: &Value) -> Option<String> {
    if let Value::Number(n) = v {
        if let Some(f) = n.as_f64() {
            if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 {
                return Some(format!("{}", f as i64));
            }
        }
    }
    present_text(v)
}

/// Numeric measure. Accepts `,` as the decimal separator; with both `.` and a
/// single `,` present, `.` is the thousands separator (`1.234,56`).
pub fn to_number(v: &Value) -> Result<Option<f64>, String> {
    if let Value::Number(n) = v {
        return match n.as_f64() {
            Some(f) if f.is_finite() => Ok(Some(f)),
            _ => Ok(None),
        };
    }
    if let Value::Bool(_) = v {
        return Err(format!("expected a number, got {v}"));
    }
    let Some(s) = present_text(v) else {
        return Ok(None);
    };

    let cleaned: String = s
        .trim_start_matches("R$")
        .trim_start_matches('$')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let commas = cleaned.matches(',').count();
    let normalized = if commas == 1 && cleaned.contains('.') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned.replace(',', ".")
    };
    match normalized.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(Some(f)),
        Ok(_) => Ok(None),
        Err(_) => Err(format!("'{s}' is not a number")),
    }
}

/// Whole-number measure; fractional input is rounded.
pub fn to_integer(v: &Value) -> Result<Option<i64>, String> {
    if let Value::Number(n) = v {
        if let Some(i) = n.as_i64() {
            return Ok(Some(i));
        }
    }
    Ok(to_number(v)?.map(|f| f.round() as i64))
}

/// Largest serial Excel can represent (9999-12-31).
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

fn from_excel_serial(serial: f64) -> Option<NaiveDate> {
    if !(1.0..=MAX_EXCEL_SERIAL).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(serial.floor() as i64))
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
];

/// Month-first before day-first for ambiguous slashes.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%Y%m%d",
];

/// Calendar date. Accepts ISO and RFC 3339 forms, common slash/dash/dot
/// layouts, and Excel serial numbers.
pub fn to_date(v: &Value) -> Result<Option<NaiveDate>, String> {
    if let Value::Number(n) = v {
        let Some(f) = n.as_f64() else {
            return Err(format!("'{n}' is not a date"));
        };
        return from_excel_serial(f)
            .map(Some)
            .ok_or_else(|| format!("'{n}' is not a date serial"));
    }
    let Some(s) = present_text(v) else {
        return Ok(None);
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(Some(dt.date_naive()));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Ok(Some(dt.date()));
        }
    }
    let date_part = s.split_whitespace().next().unwrap_or(&s);
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(date_part, fmt) {
            return Ok(Some(d));
        }
    }
    if let Ok(serial) = date_part.parse::<f64>() {
        if let Some(d) = from_excel_serial(serial) {
            return Ok(Some(d));
        }
    }
    Err(format!("'{s}' is not a date"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn numbers_with_locale_separators() {
        assert_eq!(to_number(&json!("1.234,56")).unwrap(), Some(1234.56));
        assert_eq!(to_number(&json!("10,5")).unwrap(), Some(10.5));
        assert_eq!(to_number(&json!("R$ 99.90")).unwrap(), Some(99.9));
        assert_eq!(to_number(&json!(42)).unwrap(), Some(42.0));
        assert_eq!(to_number(&json!(" NaN ")).unwrap(), None);
        assert_eq!(to_number(&Value::Null).unwrap(), None);
        assert!(to_number(&json!("abc")).is_err());
        assert!(to_number(&json!(true)).is_err());
    }

    #[test]
    fn integers_round() {
        assert_eq!(to_integer(&json!("12,6")).unwrap(), Some(13));
        assert_eq!(to_integer(&json!(7)).unwrap(), Some(7));
    }

    #[test]
    fn dates_in_common_layouts() {
        assert_eq!(to_date(&json!("2024-03-05")).unwrap(), Some(d(2024, 3, 5)));
        assert_eq!(to_date(&json!("2024-03-05T10:00:00Z")).unwrap(), Some(d(2024, 3, 5)));
        assert_eq!(to_date(&json!("2024-03-05 10:00:00")).unwrap(), Some(d(2024, 3, 5)));
        assert_eq!(to_date(&json!("03/05/2024")).unwrap(), Some(d(2024, 3, 5)));
        assert_eq!(to_date(&json!("31/01/2024")).unwrap(), Some(d(2024, 1, 31)));
        assert_eq!(to_date(&json!("31/01/2024 08:15")).unwrap(), Some(d(2024, 1, 31)));
        assert_eq!(to_date(&json!(45000)).unwrap(), Some(d(2023, 3, 15)));
        assert_eq!(to_date(&json!("NaT")).unwrap(), None);
        assert!(to_date(&json!("yesterday")).is_err());
        assert!(to_date(&json!(-3)).is_err());
    }

    #[test]
    fn text_dimensions() {
        assert_eq!(to_text(&json!("  SP ")), Some("SP".to_string()));
        assert_eq!(to_text(&json!(123.0)), Some("123".to_string()));
        assert_eq!(to_text(&json!(12)), Some("12".to_string()));
        assert_eq!(to_text(&json!("null")), None);
    }
}
