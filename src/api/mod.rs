pub mod explain;

use axum::{
    Router,
    extract::{Json, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::core::{
    BacktestError, BacktestReport, DEFAULT_DATA_PATH, PolicyConfig, SeriesBounds, SeriesError,
    SeriesMetadata, SeriesStore, SsRecipient, Summary, run_backtest,
};
use explain::{AskRequest, AskResponse, ExplainConfig, Explainer, build_http_client};

const ALLOCATION_TOLERANCE: f64 = 0.001;
const MIN_CALENDAR_YEAR: i32 = 1900;

#[derive(Parser, Debug)]
#[command(
    name = "fire-history",
    about = "Rolling historical backtest of retirement withdrawal policies"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the JSON API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, env = "FIRE_HISTORY_DATA", default_value = DEFAULT_DATA_PATH)]
        data: PathBuf,
    },
    /// Run one backtest and print the report as JSON
    Simulate(SimulateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[arg(long, env = "FIRE_HISTORY_DATA", default_value = DEFAULT_DATA_PATH)]
    pub data: PathBuf,
    #[arg(long, help = "Start year whose run is highlighted")]
    pub start_year: i32,
    #[arg(long, default_value_t = 30)]
    pub retirement_years: u32,
    #[arg(long, default_value_t = 1_000_000.0)]
    pub portfolio_start: f64,
    #[arg(long, default_value_t = 0.6, help = "Stock share as a fraction, e.g. 0.6")]
    pub stock_allocation: f64,
    #[arg(long, default_value_t = 0.4, help = "Bond share as a fraction, e.g. 0.4")]
    pub bond_allocation: f64,
    #[arg(long, default_value_t = 0.04)]
    pub withdrawal_rate_start: f64,
    #[arg(long, default_value_t = 0.03)]
    pub withdrawal_rate_min: f64,
    #[arg(long, default_value_t = 0.05)]
    pub withdrawal_rate_max: f64,
    #[arg(
        long,
        default_value_t = 1.0,
        help = "Share of a band-driven raise actually applied (0-1)"
    )]
    pub withdrawal_smoothing_up: f64,
    #[arg(
        long,
        default_value_t = 1.0,
        help = "Share of a band-driven cut actually applied (0-1)"
    )]
    pub withdrawal_smoothing_down: f64,
    #[arg(long, default_value_t = 0.0, help = "Annual fee as a fraction of the portfolio")]
    pub management_fee: f64,
    #[arg(long, default_value_t = 0.03)]
    pub inflation_rate: f64,
    #[arg(
        long = "ss-recipient",
        value_parser = parse_ss_recipient,
        help = "Social Security stream as START_YEAR:MONTHLY_AMOUNT; repeatable"
    )]
    pub ss_recipients: Vec<SsRecipient>,
    #[arg(long, help = "Print only the summary and representative indices")]
    pub summary_only: bool,
}

fn parse_ss_recipient(raw: &str) -> Result<SsRecipient, String> {
    let (year, amount) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected START_YEAR:MONTHLY_AMOUNT, got {raw:?}"))?;
    let start_year = year
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("invalid start year {year:?}: {e}"))?;
    let monthly_amount = amount
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid monthly amount {amount:?}: {e}"))?;
    Ok(SsRecipient {
        start_year,
        monthly_amount,
    })
}

fn default_smoothing() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatePayload {
    pub start_year: i32,
    pub retirement_years: u32,
    pub portfolio_start: f64,
    pub stock_allocation: f64,
    pub bond_allocation: f64,
    pub withdrawal_rate_start: f64,
    pub withdrawal_rate_min: f64,
    pub withdrawal_rate_max: f64,
    #[serde(default = "default_smoothing")]
    pub withdrawal_smoothing_up: f64,
    #[serde(default = "default_smoothing")]
    pub withdrawal_smoothing_down: f64,
    #[serde(default)]
    pub management_fee: f64,
    pub inflation_rate: f64,
    #[serde(default)]
    pub ss_recipients: Vec<SsRecipient>,
}

impl From<&SimulateArgs> for SimulatePayload {
    fn from(args: &SimulateArgs) -> Self {
        Self {
            start_year: args.start_year,
            retirement_years: args.retirement_years,
            portfolio_start: args.portfolio_start,
            stock_allocation: args.stock_allocation,
            bond_allocation: args.bond_allocation,
            withdrawal_rate_start: args.withdrawal_rate_start,
            withdrawal_rate_min: args.withdrawal_rate_min,
            withdrawal_rate_max: args.withdrawal_rate_max,
            withdrawal_smoothing_up: args.withdrawal_smoothing_up,
            withdrawal_smoothing_down: args.withdrawal_smoothing_down,
            management_fee: args.management_fee,
            inflation_rate: args.inflation_rate,
            ss_recipients: args.ss_recipients.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct SummaryOnlyResponse<'a> {
    series: SeriesBounds,
    summary: &'a Summary,
    quantile_indices: &'a [usize],
}

pub fn build_policy(payload: SimulatePayload) -> Result<PolicyConfig, String> {
    if payload.start_year < MIN_CALENDAR_YEAR {
        return Err(format!("start_year must be >= {MIN_CALENDAR_YEAR}"));
    }

    if payload.retirement_years == 0 {
        return Err("retirement_years must be > 0".to_string());
    }

    if !payload.portfolio_start.is_finite() || payload.portfolio_start <= 0.0 {
        return Err("portfolio_start must be > 0".to_string());
    }

    for (name, share) in [
        ("stock_allocation", payload.stock_allocation),
        ("bond_allocation", payload.bond_allocation),
    ] {
        if !(0.0..=1.0).contains(&share) {
            return Err(format!("{name} must be between 0 and 1"));
        }
    }

    if ((payload.stock_allocation + payload.bond_allocation) - 1.0).abs() > ALLOCATION_TOLERANCE {
        return Err("Allocations must sum to 1.0".to_string());
    }

    for (name, rate) in [
        ("withdrawal_rate_start", payload.withdrawal_rate_start),
        ("withdrawal_rate_min", payload.withdrawal_rate_min),
        ("withdrawal_rate_max", payload.withdrawal_rate_max),
    ] {
        if !rate.is_finite() || rate <= 0.0 || rate > 1.0 {
            return Err(format!("{name} must be > 0 and <= 1"));
        }
    }

    if payload.withdrawal_rate_start < payload.withdrawal_rate_min
        || payload.withdrawal_rate_start > payload.withdrawal_rate_max
    {
        return Err("withdrawal_rate_start must be between min and max".to_string());
    }

    for (name, fraction) in [
        ("withdrawal_smoothing_up", payload.withdrawal_smoothing_up),
        ("withdrawal_smoothing_down", payload.withdrawal_smoothing_down),
        ("management_fee", payload.management_fee),
    ] {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(format!("{name} must be between 0 and 1"));
        }
    }

    if !(0.0..=0.2).contains(&payload.inflation_rate) {
        return Err("inflation_rate must be between 0 and 0.2".to_string());
    }

    for (idx, recipient) in payload.ss_recipients.iter().enumerate() {
        if recipient.start_year < MIN_CALENDAR_YEAR {
            return Err(format!(
                "ss_recipients[{idx}].start_year must be >= {MIN_CALENDAR_YEAR}"
            ));
        }
        if !recipient.monthly_amount.is_finite() || recipient.monthly_amount < 0.0 {
            return Err(format!("ss_recipients[{idx}].monthly_amount must be >= 0"));
        }
    }

    Ok(PolicyConfig {
        start_year: payload.start_year,
        retirement_years: payload.retirement_years,
        portfolio_start: payload.portfolio_start,
        stock_allocation: payload.stock_allocation,
        bond_allocation: payload.bond_allocation,
        withdrawal_rate_start: payload.withdrawal_rate_start,
        withdrawal_rate_min: payload.withdrawal_rate_min,
        withdrawal_rate_max: payload.withdrawal_rate_max,
        withdrawal_smoothing_up: payload.withdrawal_smoothing_up,
        withdrawal_smoothing_down: payload.withdrawal_smoothing_down,
        management_fee: payload.management_fee,
        inflation_rate: payload.inflation_rate,
        ss_recipients: payload.ss_recipients,
    })
}

pub fn simulate_report(
    store: &SeriesStore,
    payload: SimulatePayload,
) -> Result<BacktestReport, BacktestError> {
    let config = build_policy(payload).map_err(BacktestError::Validation)?;
    let series = store.get()?;
    run_backtest(&config, &series)
}

pub fn run_simulate_command(args: &SimulateArgs) -> Result<String, String> {
    let store = SeriesStore::new(&args.data);
    let report =
        simulate_report(&store, SimulatePayload::from(args)).map_err(|e| e.to_string())?;
    log::info!(
        "{} of {} historical cohorts succeeded",
        report.summary.success_count,
        report.summary.total_runs
    );

    let json = if args.summary_only {
        serde_json::to_string_pretty(&SummaryOnlyResponse {
            series: report.series,
            summary: &report.summary,
            quantile_indices: &report.quantile_indices,
        })
    } else {
        serde_json::to_string_pretty(&report)
    };
    json.map_err(|e| format!("failed to encode report: {e}"))
}

#[derive(Clone)]
pub struct AppState {
    series: Arc<SeriesStore>,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(series: SeriesStore) -> Result<Self, explain::ExplainError> {
        Ok(Self {
            series: Arc::new(series),
            http: build_http_client()?,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/series/metadata", get(metadata_handler))
        .route("/api/v1/simulate", post(simulate_handler))
        .route("/api/v1/ask", post(ask_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn run_http_server(port: u16, data_path: PathBuf) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = AppState::new(SeriesStore::new(data_path)).map_err(std::io::Error::other)?;
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    log::info!("historical backtest API listening on http://{addr}");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn metadata_handler(State(state): State<AppState>) -> Response {
    match state.series.get() {
        Ok(series) => json_response(StatusCode::OK, SeriesMetadata::for_series(&series)),
        Err(err) => series_error_response(&err),
    }
}

async fn simulate_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    log::debug!(
        "simulate request: start_year={} retirement_years={}",
        payload.start_year,
        payload.retirement_years
    );
    match simulate_report(&state.series, payload) {
        Ok(report) => json_response(StatusCode::OK, report),
        Err(err) => backtest_error_response(&err),
    }
}

async fn ask_handler(State(state): State<AppState>, Json(request): Json<AskRequest>) -> Response {
    let config = match ExplainConfig::from_env() {
        Ok(config) => config,
        Err(err) => return explain_error_response(&err),
    };
    let explainer = Explainer::new(state.http.clone(), config);
    match explainer.ask(&request).await {
        Ok(answer) => json_response(StatusCode::OK, AskResponse { answer }),
        Err(err) => explain_error_response(&err),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn series_error_response(err: &SeriesError) -> Response {
    log::error!("historical data unavailable: {err}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

fn backtest_error_response(err: &BacktestError) -> Response {
    match err {
        BacktestError::DataUnavailable(series_err) => series_error_response(series_err),
        err if err.is_user_error() => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        err => {
            log::error!("backtest failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn explain_error_response(err: &explain::ExplainError) -> Response {
    log::warn!("explanation request failed: {err}");
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
    error_response(status, &err.to_string())
}
