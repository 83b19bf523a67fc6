//! SQL literal rendering for data dumps.

use crate::Result;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{Row, TypeInfo, ValueRef};

/// Render one column of a row as a SQL literal suitable for an
/// `INSERT ... VALUES` statement.
pub fn sql_literal(row: &MySqlRow, idx: usize) -> Result<String> {
    let raw = row
        .try_get_raw(idx)
        .with_context(|| format!("column {} out of range", idx))?;
    if raw.is_null() {
        return Ok("NULL".to_string());
    }
    let type_name = raw.type_info().name().to_string();

    let rendered = match type_name.as_str() {
        "BOOLEAN" => row
            .try_get::<bool, _>(idx)
            .map(|b| if b { "1".to_string() } else { "0".to_string() }),
        name if name.contains("INT") && name.contains("UNSIGNED") => {
            row.try_get::<u64, _>(idx).map(|v| v.to_string())
        }
        name if name.contains("INT") => row.try_get::<i64, _>(idx).map(|v| v.to_string()),
        "FLOAT" => row.try_get::<f32, _>(idx).map(|v| v.to_string()),
        "DOUBLE" => row.try_get::<f64, _>(idx).map(|v| v.to_string()),
        "DECIMAL" => row
            .try_get::<rust_decimal::Decimal, _>(idx)
            .map(|v| v.to_string()),
        "DATE" => row
            .try_get::<NaiveDate, _>(idx)
            .map(|v| format!("'{}'", v.format("%Y-%m-%d"))),
        "TIME" => row
            .try_get::<NaiveTime, _>(idx)
            .map(|v| format!("'{}'", v.format("%H:%M:%S"))),
        "DATETIME" => row
            .try_get::<NaiveDateTime, _>(idx)
            .map(|v| format!("'{}'", v.format("%Y-%m-%d %H:%M:%S"))),
        "TIMESTAMP" => row
            .try_get::<DateTime<Utc>, _>(idx)
            .map(|v| format!("'{}'", v.format("%Y-%m-%d %H:%M:%S"))),
        "BIT" => row.try_get::<u64, _>(idx).map(|v| v.to_string()),
        "JSON" => row
            .try_get::<serde_json::Value, _>(idx)
            .map(|v| quoted(&v.to_string())),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|v| format!("X'{}'", hex::encode(v))),
        // CHAR, VARCHAR, TEXT, ENUM, SET, YEAR and anything else textual.
        _ => row.try_get::<String, _>(idx).map(|v| quoted(&v)),
    };

    match rendered {
        Ok(lit) => Ok(lit),
        // Unknown or surprising column type: fall back through the lossless
        // representations before giving up.
        Err(_) => fallback_literal(row, idx, &type_name),
    }
}

fn fallback_literal(row: &MySqlRow, idx: usize, type_name: &str) -> Result<String> {
    if let Ok(s) = row.try_get::<String, _>(idx) {
        return Ok(quoted(&s));
    }
    if let Ok(b) = row.try_get::<Vec<u8>, _>(idx) {
        return Ok(format!("X'{}'", hex::encode(b)));
    }
    Err(crate::Error::Internal(anyhow::anyhow!(
        "cannot render column {} of type {} as a SQL literal",
        idx,
        type_name
    )))
}

/// Quote a string literal. Newlines are escaped so a value can never end a
/// line with a statement terminator and confuse the splitter on restore.
pub fn quoted(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('\'', "''")
        .replace('\n', "\\n")
        .replace('\r', "\\r");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_doubles_single_quotes() {
        assert_eq!(quoted("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn quoting_escapes_backslashes() {
        assert_eq!(quoted(r"C:\tmp"), r"'C:\\tmp'");
    }

    #[test]
    fn quoting_plain_text_is_untouched() {
        assert_eq!(quoted("hello"), "'hello'");
    }

    #[test]
    fn quoting_escapes_newlines() {
        assert_eq!(quoted("a;\nb"), "'a;\\nb'");
        assert_eq!(quoted("a\r\nb"), "'a\\r\\nb'");
    }
}
