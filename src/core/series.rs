//! Historical stock/bond return series, loaded from a
//! `year,stock_return,bond_return` CSV with returns as fractions.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use super::error::SeriesError;
use super::types::{SeriesBounds, YearReturns};

pub const DEFAULT_DATA_PATH: &str = "data/historical.csv";

const STOCK_SOURCE: &str = "Shiller P";
const BOND_SOURCE: &str = "Shiller Long Rate";

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalSeries {
    first_year: i32,
    years: Vec<YearReturns>,
}

impl HistoricalSeries {
    pub fn from_rows(
        mut rows: Vec<YearReturns>,
        source_name: &str,
    ) -> Result<Self, SeriesError> {
        if rows.is_empty() {
            return Err(SeriesError::Empty {
                source_name: source_name.to_string(),
            });
        }

        rows.sort_by_key(|row| row.year);
        for pair in rows.windows(2) {
            let expected = pair[0].year + 1;
            if pair[1].year == pair[0].year {
                return Err(SeriesError::Duplicate { year: pair[1].year });
            }
            if pair[1].year != expected {
                return Err(SeriesError::Gap {
                    expected,
                    found: pair[1].year,
                });
            }
        }

        Ok(Self {
            first_year: rows[0].year,
            years: rows,
        })
    }

    pub fn bounds(&self) -> SeriesBounds {
        SeriesBounds {
            min_year: self.first_year,
            max_year: self.first_year + self.years.len() as i32 - 1,
        }
    }

    pub fn returns(&self, year: i32) -> Option<YearReturns> {
        let offset = usize::try_from(year.checked_sub(self.first_year)?).ok()?;
        self.years.get(offset).copied()
    }

    pub fn len(&self) -> usize {
        self.years.len()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &YearReturns> {
        self.years.iter()
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    year: i32,
    stock_return: f64,
    bond_return: f64,
}

pub fn load_series(path: &Path) -> Result<HistoricalSeries, SeriesError> {
    if !path.exists() {
        return Err(SeriesError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path).map_err(csv::Error::from)?;
    load_series_from_reader(file, &path.display().to_string())
}

pub fn load_series_from_reader<R: Read>(
    reader: R,
    source_name: &str,
) -> Result<HistoricalSeries, SeriesError> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        rows.push(YearReturns {
            year: row.year,
            stock_return: row.stock_return,
            bond_return: row.bond_return,
        });
    }
    HistoricalSeries::from_rows(rows, source_name)
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesMetadata {
    pub min_year: i32,
    pub max_year: i32,
    pub stocks: &'static str,
    pub bonds: &'static str,
}

impl SeriesMetadata {
    pub fn for_series(series: &HistoricalSeries) -> Self {
        let bounds = series.bounds();
        Self {
            min_year: bounds.min_year,
            max_year: bounds.max_year,
            stocks: STOCK_SOURCE,
            bonds: BOND_SOURCE,
        }
    }
}

/// Load-once handle. A failed load is not cached.
#[derive(Debug)]
pub struct SeriesStore {
    path: PathBuf,
    cell: OnceLock<Arc<HistoricalSeries>>,
}

impl SeriesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: OnceLock::new(),
        }
    }

    pub fn preloaded(series: HistoricalSeries) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Arc::new(series));
        Self {
            path: PathBuf::new(),
            cell,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Result<Arc<HistoricalSeries>, SeriesError> {
        if let Some(series) = self.cell.get() {
            return Ok(Arc::clone(series));
        }

        let loaded = load_series(&self.path)?;
        let bounds = loaded.bounds();
        // Another thread may have won the race; either copy is identical.
        let series = self.cell.get_or_init(|| Arc::new(loaded));
        log::info!(
            "loaded historical series from {} ({}-{}, {} years)",
            self.path.display(),
            bounds.min_year,
            bounds.max_year,
            series.len()
        );
        Ok(Arc::clone(series))
    }
}
