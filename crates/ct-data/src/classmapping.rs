//! Class mapping from raw crop codes to contiguous class indices.

use csv::ReaderBuilder;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ct_types::{DataError, TuneResult};

/// Maps raw crop codes (the `id` column) to class indices (`classid`).
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMapping {
    code_to_class: HashMap<i64, usize>,
    class_names: Vec<String>,
}

impl ClassMapping {
    /// Build from `(raw code, class id, class name)` rows. Class ids need not
    /// be contiguous; they are renumbered in ascending order.
    pub fn from_rows(rows: impl IntoIterator<Item = (i64, i64, Option<String>)>) -> TuneResult<Self> {
        let rows: Vec<_> = rows.into_iter().collect();
        if rows.is_empty() {
            return Err(DataError::InsufficientData {
                message: "class mapping has no rows".to_string(),
            }
            .into());
        }

        let mut names: BTreeMap<i64, String> = BTreeMap::new();
        for (_, classid, name) in &rows {
            let entry = names
                .entry(*classid)
                .or_insert_with(|| format!("class_{classid}"));
            if let Some(name) = name {
                *entry = name.clone();
            }
        }

        let index: HashMap<i64, usize> = names.keys().enumerate().map(|(i, c)| (*c, i)).collect();
        let code_to_class = rows
            .iter()
            .map(|(code, classid, _)| (*code, index[classid]))
            .collect();

        Ok(Self {
            code_to_class,
            class_names: names.into_values().collect(),
        })
    }

    /// Load a mapping CSV with `id` and `classid` columns and an optional
    /// `classname` column. A leading unnamed index column is ignored.
    pub fn load<P: AsRef<Path>>(path: P) -> TuneResult<Self> {
        let path = path.as_ref();
        tracing::info!("Loading class mapping from: {}", path.display());

        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to open class mapping {}: {}", path.display(), e),
            })?;

        let headers = rdr
            .headers()
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read class mapping headers: {}", e),
            })?
            .clone();
        let find = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
        let code_col = find("id").ok_or_else(|| DataError::InvalidFormat {
            message: format!("class mapping {} has no 'id' column", path.display()),
        })?;
        let class_col = find("classid").ok_or_else(|| DataError::InvalidFormat {
            message: format!("class mapping {} has no 'classid' column", path.display()),
        })?;
        let name_col = find("classname");

        let mut rows = Vec::new();
        for (line_num, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read class mapping at line {}: {}", line_num + 2, e),
            })?;
            let parse = |col: usize, field: &str| -> TuneResult<i64> {
                record
                    .get(col)
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .map(|v| v as i64)
                    .ok_or_else(|| {
                        DataError::ParseError {
                            message: format!("invalid {} at line {}", field, line_num + 2),
                        }
                        .into()
                    })
            };
            let code = parse(code_col, "id")?;
            let classid = parse(class_col, "classid")?;
            let name = name_col
                .and_then(|c| record.get(c))
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty());
            rows.push((code, classid, name));
        }

        let mapping = Self::from_rows(rows)?;
        tracing::info!(
            "Loaded class mapping with {} codes and {} classes",
            mapping.code_to_class.len(),
            mapping.nclasses()
        );
        Ok(mapping)
    }

    /// Identity mapping for datasets that already carry class indices.
    pub fn identity(nclasses: usize) -> Self {
        Self {
            code_to_class: (0..nclasses).map(|c| (c as i64, c)).collect(),
            class_names: (0..nclasses).map(|c| format!("class_{c}")).collect(),
        }
    }

    pub fn class_of(&self, code: i64) -> Option<usize> {
        self.code_to_class.get(&code).copied()
    }

    pub fn nclasses(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }
}
