//! Small column-ordered tables handed between report scripts and the page.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("malformed table: {0}")]
    Shape(String),

    #[error("CSV line {line}: {message}")]
    Csv { line: usize, message: String },
}

/// Rows of JSON cells under named columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    /// Build from an array of objects; columns appear in first-seen order and
    /// missing cells become `null`.
    pub fn from_records(records: &[Value]) -> Result<Self, TableError> {
        let mut columns: IndexSet<String> = IndexSet::new();
        for (i, record) in records.iter().enumerate() {
            let obj = record
                .as_object()
                .ok_or_else(|| TableError::Shape(format!("record {} is not an object", i)))?;
            columns.extend(obj.keys().cloned());
        }
        let rows = records
            .iter()
            .filter_map(Value::as_object)
            .map(|obj| {
                columns
                    .iter()
                    .map(|c| obj.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Ok(Self {
            columns: columns.into_iter().collect(),
            rows,
        })
    }

    /// Build from an object of equally long column arrays
    pub fn from_columns(columns: &Map<String, Value>) -> Result<Self, TableError> {
        let mut names = Vec::with_capacity(columns.len());
        let mut data: Vec<&Vec<Value>> = Vec::with_capacity(columns.len());
        for (name, values) in columns {
            let values = values
                .as_array()
                .ok_or_else(|| TableError::Shape(format!("column {} is not an array", name)))?;
            names.push(name.clone());
            data.push(values);
        }
        let len = data.first().map(|d| d.len()).unwrap_or(0);
        if let Some(pos) = data.iter().position(|d| d.len() != len) {
            return Err(TableError::Shape(format!(
                "column {} has {} values, expected {}",
                names[pos],
                data[pos].len(),
                len
            )));
        }
        let rows = (0..len)
            .map(|i| data.iter().map(|col| col[i].clone()).collect())
            .collect();
        Ok(Self {
            columns: names,
            rows,
        })
    }

    /// Parse CSV with a header line. Quoted fields may contain the delimiter,
    /// doubled quotes and newlines. Numeric cells become numbers and empty
    /// cells become `null`.
    pub fn from_csv(text: &str, delimiter: char) -> Result<Self, TableError> {
        let mut records = parse_csv(text, delimiter)?.into_iter();
        let Some(header) = records.next() else {
            return Ok(Self::default());
        };
        let columns: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();
        let mut rows = Vec::new();
        for (i, record) in records.enumerate() {
            if record.len() == 1 && record[0].is_empty() {
                continue;
            }
            if record.len() != columns.len() {
                return Err(TableError::Csv {
                    line: i + 2,
                    message: format!("expected {} fields, found {}", columns.len(), record.len()),
                });
            }
            rows.push(record.iter().map(|cell| infer_cell(cell)).collect());
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, TableError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| TableError::UnknownColumn(name.to_string()))
    }

    pub fn column(&self, name: &str) -> Result<Vec<Value>, TableError> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r.get(idx).cloned().unwrap_or(Value::Null)).collect())
    }

    pub fn select(&self, names: &[String]) -> Result<Self, TableError> {
        let idx = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            columns: names.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|r| idx.iter().map(|&i| r.get(i).cloned().unwrap_or(Value::Null)).collect())
                .collect(),
        })
    }

    /// Stable sort on one column; nulls always go last.
    pub fn sort_by(&self, name: &str, descending: bool) -> Result<Self, TableError> {
        let idx = self.column_index(name)?;
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| {
            let (a, b) = (a.get(idx).unwrap_or(&Value::Null), b.get(idx).unwrap_or(&Value::Null));
            match (a.is_null(), b.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ if descending => compare_cells(b, a),
                _ => compare_cells(a, b),
            }
        });
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }

    pub fn head(&self, n: usize) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Rows as objects keyed by column name
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                Value::Object(
                    self.columns
                        .iter()
                        .cloned()
                        .zip(row.iter().cloned())
                        .collect(),
                )
            })
            .collect()
    }
}

fn compare_cells(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => cell_text(a).cmp(&cell_text(b)),
    }
}

/// Display text of a cell; strings without their JSON quotes
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn infer_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>()
        && let Some(n) = Number::from_f64(f)
    {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

fn parse_csv(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, TableError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut chars = text.trim_start_matches('\u{feff}').chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
                line += 1;
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(TableError::Csv {
            line,
            message: "unterminated quoted field".to_string(),
        });
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_records_keeps_first_seen_column_order() {
        let table = Table::from_records(&[
            json!({ "region": "Norte", "cases": 12 }),
            json!({ "cases": 7, "region": "Sul", "deaths": 1 }),
        ])
        .unwrap();
        assert_eq!(table.columns, vec!["region", "cases", "deaths"]);
        assert_eq!(table.rows[0], vec![json!("Norte"), json!(12), Value::Null]);
        assert_eq!(table.rows[1], vec![json!("Sul"), json!(7), json!(1)]);
    }

    #[test]
    fn test_from_records_rejects_scalars() {
        assert!(matches!(
            Table::from_records(&[json!(1)]),
            Err(TableError::Shape(_))
        ));
    }

    #[test]
    fn test_from_columns_requires_equal_lengths() {
        let ok = json!({ "x": [1, 2], "y": ["a", "b"] });
        let table = Table::from_columns(ok.as_object().unwrap()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("y").unwrap(), vec![json!("a"), json!("b")]);

        let bad = json!({ "x": [1, 2], "y": ["a"] });
        assert!(Table::from_columns(bad.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_csv_quotes_and_types() {
        let csv = "name,count,note\r\n\"Silva, Ana\",3,\"said \"\"hi\"\"\"\nBruno,,\"two\nlines\"\n";
        let table = Table::from_csv(csv, ',').unwrap();
        assert_eq!(table.columns, vec!["name", "count", "note"]);
        assert_eq!(table.rows[0], vec![json!("Silva, Ana"), json!(3), json!("said \"hi\"")]);
        assert_eq!(table.rows[1], vec![json!("Bruno"), Value::Null, json!("two\nlines")]);
    }

    #[test]
    fn test_csv_errors() {
        assert!(matches!(
            Table::from_csv("a,b\n1\n", ','),
            Err(TableError::Csv { line: 2, .. })
        ));
        assert!(Table::from_csv("a\n\"open", ',').is_err());
        assert!(Table::from_csv("", ',').unwrap().columns.is_empty());
    }

    #[test]
    fn test_select_sort_head() {
        let table = Table::from_csv("city;pop\nB;20\nA;\nC;5\n", ';').unwrap();

        let sorted = table.sort_by("pop", true).unwrap();
        assert_eq!(sorted.column("city").unwrap(), vec![json!("B"), json!("C"), json!("A")]);

        let asc = table.sort_by("city", false).unwrap().head(2);
        assert_eq!(asc.column("city").unwrap(), vec![json!("A"), json!("B")]);

        let only = table.select(&["pop".to_string()]).unwrap();
        assert_eq!(only.columns, vec!["pop"]);
        assert!(matches!(
            table.select(&["nope".to_string()]),
            Err(TableError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_to_records_round_trips_shape() {
        let table = Table::from_records(&[json!({ "a": 1, "b": "x" })]).unwrap();
        assert_eq!(table.to_records(), vec![json!({ "a": 1, "b": "x" })]);
    }
}
