use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("missing historical data at {}; run the ingest step first", .path.display())]
    NotFound { path: PathBuf },
    #[error("historical series is empty; check {source_name}")]
    Empty { source_name: String },
    #[error("failed to read historical data: {0}")]
    Read(#[from] csv::Error),
    #[error("historical series has a gap: expected year {expected}, found {found}")]
    Gap { expected: i32, found: i32 },
    #[error("historical series lists year {year} more than once")]
    Duplicate { year: i32 },
}

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("{0}")]
    Validation(String),
    #[error("Retirement horizon exceeds data. Max years available: {max_years}.")]
    HorizonExceedsData { requested: u32, max_years: u32 },
    #[error(transparent)]
    DataUnavailable(#[from] SeriesError),
    #[error("no historical returns for year {year}")]
    MissingYear { year: i32 },
}

impl BacktestError {
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::HorizonExceedsData { .. })
    }
}
