use csv::ReaderBuilder;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use ct_types::{DataError, TuneError, TuneResult};

/// Columns of a parcel CSV that are not spectral bands.
const RESERVED_COLUMNS: &[&str] = &["label", "id", "timestamp", "date", "doa", "time"];

/// Raw observations of one field parcel as read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Parcel {
    pub id: i64,
    /// Raw crop code, if the file carries a `label` column.
    pub code: Option<i64>,
    /// `T x D` band values in file order.
    pub series: Vec<Vec<f64>>,
    pub bands: Vec<String>,
}

/// Loads parcel CSVs for a region, parsing files in parallel.
#[derive(Debug)]
pub struct ParcelLoader {
    workers: usize,
}

impl ParcelLoader {
    pub fn new() -> Self {
        Self { workers: 2 }
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Directory holding the per-parcel CSVs of one region.
    pub fn region_dir(root: &Path, dataset: &str, region: &str) -> PathBuf {
        root.join(dataset).join("csv").join(region)
    }

    /// Load every parcel of `region`, optionally restricted to `ids`.
    /// Unreadable parcel files are skipped with a warning.
    pub fn load_region(
        &self,
        root: &Path,
        dataset: &str,
        region: &str,
        ids: Option<&HashSet<i64>>,
    ) -> TuneResult<Vec<Parcel>> {
        let dir = Self::region_dir(root, dataset, region);
        tracing::info!("Loading parcels from: {}", dir.display());

        if !dir.is_dir() {
            return Err(DataError::SourceNotFound(dir.display().to_string()).into());
        }

        let mut files: Vec<(i64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            else {
                tracing::debug!("Skipping non-parcel file {}", path.display());
                continue;
            };
            if ids.map_or(true, |ids| ids.contains(&id)) {
                files.push((id, path));
            }
        }
        files.sort_by_key(|(id, _)| *id);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to start loader pool: {}", e),
            })?;

        let parsed: Vec<Option<Parcel>> = pool.install(|| {
            files
                .par_iter()
                .map(|(id, path)| match Self::load_parcel_csv(path, *id) {
                    Ok(parcel) => Some(parcel),
                    Err(e) => {
                        tracing::warn!("Skipping parcel {}: {}", path.display(), e);
                        None
                    }
                })
                .collect()
        });

        let parcels: Vec<Parcel> = parsed.into_iter().flatten().collect();
        tracing::info!("Loaded {} parcels from region {}", parcels.len(), region);
        Ok(parcels)
    }

    /// Parse a single parcel CSV. Every non-reserved column is a band.
    pub fn load_parcel_csv<P: AsRef<Path>>(path: P, id: i64) -> TuneResult<Parcel> {
        let path = path.as_ref();
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to open CSV file {}: {}", path.display(), e),
            })?;

        let headers = rdr
            .headers()
            .map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read CSV headers: {}", e),
            })?
            .clone();

        let mut band_cols = Vec::new();
        let mut bands = Vec::new();
        let mut label_col = None;
        for (i, header) in headers.iter().enumerate() {
            let name = header.trim();
            if name.eq_ignore_ascii_case("label") {
                label_col = Some(i);
            } else if !RESERVED_COLUMNS.iter().any(|r| r.eq_ignore_ascii_case(name)) && !name.is_empty() {
                band_cols.push(i);
                bands.push(name.to_string());
            }
        }
        if band_cols.is_empty() {
            return Err(DataError::InvalidFormat {
                message: format!("{} has no band columns", path.display()),
            }
            .into());
        }

        let mut series = Vec::new();
        let mut code = None;
        for (line_num, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| DataError::LoadingFailed {
                message: format!("Failed to read CSV record at line {}: {}", line_num + 2, e),
            })?;

            let row = band_cols
                .iter()
                .map(|&c| {
                    record
                        .get(c)
                        .and_then(|v| v.trim().parse::<f64>().ok())
                        .ok_or_else(|| DataError::ParseError {
                            message: format!(
                                "invalid value in column {} at line {} of {}",
                                headers.get(c).unwrap_or("?"),
                                line_num + 2,
                                path.display()
                            ),
                        })
                })
                .collect::<Result<Vec<f64>, DataError>>()?;
            series.push(row);

            if code.is_none() {
                code = label_col
                    .and_then(|c| record.get(c))
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .map(|v| v as i64);
            }
        }

        if series.is_empty() {
            return Err(DataError::InsufficientData {
                message: format!("{} has no observations", path.display()),
            }
            .into());
        }

        Ok(Parcel {
            id,
            code,
            series,
            bands,
        })
    }
}

impl Default for ParcelLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a list of parcel ids, one per line. Blank lines and `#` comments are
/// ignored.
pub fn read_id_list<P: AsRef<Path>>(path: P) -> TuneResult<Vec<i64>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| DataError::LoadingFailed {
        message: format!("Failed to read id list {}: {}", path.display(), e),
    })?;

    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(i, line)| {
            line.parse::<i64>().map_err(|_| {
                TuneError::from(DataError::ParseError {
                    message: format!("invalid id '{}' at line {} of {}", line, i + 1, path.display()),
                })
            })
        })
        .collect()
}
