//! Columnar dataset storage for likelihood evaluation.

use cf_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};

/// Read-only, fixed-size collection of entries with named variable values.
///
/// Values are stored column-wise (Structure-of-Arrays).
#[derive(Debug, Clone)]
pub struct Dataset {
    n_entries: usize,
    column_names: Vec<String>,
    columns: Vec<Vec<f64>>,
    name_to_index: HashMap<String, usize>,
}

impl Dataset {
    /// Create a [`Dataset`] from materialized columns.
    ///
    /// All columns must have the same length and contain only finite values. Column order
    /// follows the name order of the input.
    pub fn from_columns(columns: impl IntoIterator<Item = (String, Vec<f64>)>) -> Result<Self> {
        let mut by_name: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (name, col) in columns {
            if by_name.insert(name.clone(), col).is_some() {
                return Err(Error::Validation(format!("duplicate column '{name}'")));
            }
        }
        if by_name.is_empty() {
            return Err(Error::Validation("Dataset requires at least one column".into()));
        }

        let mut n_entries: Option<usize> = None;
        let mut column_names = Vec::with_capacity(by_name.len());
        let mut cols = Vec::with_capacity(by_name.len());
        for (name, col) in by_name {
            match n_entries {
                Some(n) if n != col.len() => {
                    return Err(Error::Validation(format!(
                        "column length mismatch for '{name}': expected {n}, got {}",
                        col.len()
                    )));
                }
                Some(_) => {}
                None => n_entries = Some(col.len()),
            }
            if col.iter().any(|x| !x.is_finite()) {
                return Err(Error::Validation(format!(
                    "column '{name}' contains non-finite values"
                )));
            }
            column_names.push(name);
            cols.push(col);
        }

        let name_to_index =
            column_names.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect::<HashMap<_, _>>();

        Ok(Self { n_entries: n_entries.unwrap_or(0), column_names, columns: cols, name_to_index })
    }

    /// Build a dataset from row-wise entries, e.g. generated points keyed by variable name.
    ///
    /// Every row must carry exactly the variables of the first row.
    pub fn from_rows(rows: &[BTreeMap<String, f64>]) -> Result<Self> {
        let first = rows
            .first()
            .ok_or_else(|| Error::Validation("Dataset::from_rows requires at least one row".into()))?;
        let names: Vec<String> = first.keys().cloned().collect();
        let mut cols: Vec<Vec<f64>> = vec![Vec::with_capacity(rows.len()); names.len()];
        for (i, row) in rows.iter().enumerate() {
            if row.len() != names.len() {
                return Err(Error::Validation(format!(
                    "row {i} has {} variables, expected {}",
                    row.len(),
                    names.len()
                )));
            }
            for (col, name) in cols.iter_mut().zip(&names) {
                let v = row.get(name).ok_or_else(|| {
                    Error::Validation(format!("row {i} is missing variable '{name}'"))
                })?;
                col.push(*v);
            }
        }
        Self::from_columns(names.into_iter().zip(cols))
    }

    /// Number of entries.
    pub fn n_entries(&self) -> usize {
        self.n_entries
    }

    /// Whether the dataset has no entries.
    pub fn is_empty(&self) -> bool {
        self.n_entries == 0
    }

    /// Names of stored columns (stable order).
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Whether a column with this name exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        let idx = self.name_to_index.get(name).copied()?;
        self.columns.get(idx).map(|c| c.as_slice())
    }

    /// Value of a named variable at an entry.
    pub fn value(&self, name: &str, entry: usize) -> Result<f64> {
        let col = self
            .column(name)
            .ok_or_else(|| Error::Validation(format!("missing column '{name}'")))?;
        col.get(entry).copied().ok_or_else(|| {
            Error::Validation(format!("entry {entry} out of range (n_entries = {})", self.n_entries))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_are_name_ordered_and_addressable() {
        let ds = Dataset::from_columns(vec![
            ("y".to_string(), vec![3.0, 4.0]),
            ("x".to_string(), vec![1.0, 2.0]),
        ])
        .unwrap();
        assert_eq!(ds.n_entries(), 2);
        assert_eq!(ds.column_names(), &["x".to_string(), "y".to_string()]);
        assert_eq!(ds.value("y", 1).unwrap(), 4.0);
        assert!(ds.value("z", 0).is_err());
        assert!(ds.value("x", 2).is_err());
    }

    #[test]
    fn test_rejects_ragged_and_non_finite_columns() {
        let ragged = Dataset::from_columns(vec![
            ("x".to_string(), vec![1.0, 2.0]),
            ("y".to_string(), vec![1.0]),
        ]);
        assert!(ragged.is_err());

        let nan = Dataset::from_columns(vec![("x".to_string(), vec![1.0, f64::NAN])]);
        assert!(nan.is_err());
    }

    #[test]
    fn test_from_rows() {
        let rows: Vec<BTreeMap<String, f64>> = (0..3)
            .map(|i| BTreeMap::from([("a".to_string(), i as f64), ("b".to_string(), -(i as f64))]))
            .collect();
        let ds = Dataset::from_rows(&rows).unwrap();
        assert_eq!(ds.column("b").unwrap(), &[0.0, -1.0, -2.0]);
    }
}
