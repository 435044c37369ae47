mod engine;
mod error;
mod series;
mod summary;
mod types;

pub use engine::{run_backtest, run_rolling_cohorts, simulate_start_year};
pub use error::{BacktestError, SeriesError};
pub use series::{
    DEFAULT_DATA_PATH, HistoricalSeries, SeriesMetadata, SeriesStore, load_series,
    load_series_from_reader,
};
pub use summary::{compute_quantile_indices, percentile, summarize_results};
pub use types::{
    BacktestReport, PercentileMap, PolicyConfig, SeriesBounds, SimulationRun, SsRecipient,
    Summary, YearReturns,
};
