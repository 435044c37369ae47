use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SsRecipient {
    pub start_year: i32,
    pub monthly_amount: f64,
}

impl SsRecipient {
    pub fn annual_amount_in(&self, year: i32) -> f64 {
        if year >= self.start_year {
            self.monthly_amount * 12.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyConfig {
    pub start_year: i32,
    pub retirement_years: u32,
    pub portfolio_start: f64,
    pub stock_allocation: f64,
    pub bond_allocation: f64,
    pub withdrawal_rate_start: f64,
    pub withdrawal_rate_min: f64,
    pub withdrawal_rate_max: f64,
    pub withdrawal_smoothing_up: f64,
    pub withdrawal_smoothing_down: f64,
    pub management_fee: f64,
    pub inflation_rate: f64,
    pub ss_recipients: Vec<SsRecipient>,
}

impl PolicyConfig {
    pub fn clamp_rate(&self, rate: f64) -> f64 {
        rate.min(self.withdrawal_rate_max).max(self.withdrawal_rate_min)
    }

    pub fn ss_annual_income(&self, year: i32) -> f64 {
        self.ss_recipients
            .iter()
            .map(|recipient| recipient.annual_amount_in(year))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct YearReturns {
    pub year: i32,
    pub stock_return: f64,
    pub bond_return: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeriesBounds {
    pub min_year: i32,
    pub max_year: i32,
}

impl SeriesBounds {
    pub fn span_years(self) -> u32 {
        (self.max_year - self.min_year + 1) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationRun {
    pub start_year: i32,
    pub success: bool,
    pub ending_balance: f64,
    pub yearly_balances: Vec<f64>,
    pub yearly_withdrawals: Vec<f64>,
    pub yearly_fees: Vec<f64>,
    pub highlight: bool,
}

impl SimulationRun {
    pub fn total_withdrawals(&self) -> f64 {
        self.yearly_withdrawals.iter().sum()
    }

    pub fn total_fees(&self) -> f64 {
        self.yearly_fees.iter().sum()
    }
}

pub type PercentileMap = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_runs: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub success_rate: f64,
    pub ending_balance_percentiles: PercentileMap,
    pub portfolio_quantiles: PercentileMap,
    pub spending_quantiles: PercentileMap,
    pub fee_quantiles: PercentileMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub series: SeriesBounds,
    pub results: Vec<SimulationRun>,
    pub summary: Summary,
    pub quantile_indices: Vec<usize>,
}
