//! Query result models.

use crate::error::BurrowError;

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Results from query execution.
///
/// Rows keep the order the server returned them in; each row holds one
/// value per column, in column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    /// Column names
    columns: Vec<String>,
    /// Result rows
    rows: Vec<Vec<Value>>,
    /// Time to execute in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a result from column names and rows.
    ///
    /// Fails if any row has a different width than the column list.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, BurrowError> {
        if let Some((index, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len())
        {
            return Err(BurrowError::internal(format!(
                "row {index} has {} values, expected {}",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows, execution_time_ms: 0 })
    }

    /// Set the execution time.
    pub fn with_execution_time_ms(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    /// Get the number of rows returned.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get column names.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(String::as_str).collect()
    }

    /// Get the position of a column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Get a row by position.
    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|values| Row { columns: &self.columns, values })
    }

    /// Iterate over rows in order.
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(|values| Row { columns: &self.columns, values })
    }

    /// Convert every row into a JSON object keyed by column name.
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        self.rows().map(|row| row.to_record()).collect()
    }
}

/// Serialized as an array of records.
impl Serialize for QueryResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in self.rows() {
            seq.serialize_element(&row.to_record())?;
        }
        seq.end()
    }
}

/// A borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> Row<'a> {
    /// Get a value by column name.
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.columns.iter().position(|c| c == column).and_then(|i| self.values.get(i))
    }

    /// Get a value by position.
    pub fn get_index(&self, index: usize) -> Option<&'a Value> {
        self.values.get(index)
    }

    /// Values in column order.
    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    /// Iterate over (column, value) pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }

    /// Convert to a JSON object keyed by column name.
    pub fn to_record(&self) -> Map<String, Value> {
        self.iter().map(|(c, v)| (c.to_string(), v.clone())).collect()
    }
}
