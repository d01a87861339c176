//! Materialized query results.

/// Rows returned by a query, in text form.
///
/// `None` cells are SQL NULLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The only cell of a one-row, one-column result.
    pub fn single_value(&self) -> Option<Option<&str>> {
        match self.rows.as_slice() {
            [row] if row.len() == 1 => Some(row[0].as_deref()),
            _ => None,
        }
    }
}
