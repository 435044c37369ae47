use rayon::prelude::*;

use super::error::BacktestError;
use super::series::HistoricalSeries;
use super::summary::{compute_quantile_indices, summarize_results};
use super::types::{BacktestReport, PolicyConfig, SimulationRun};

pub fn run_backtest(
    config: &PolicyConfig,
    series: &HistoricalSeries,
) -> Result<BacktestReport, BacktestError> {
    let results = run_rolling_cohorts(config, series)?;
    let summary = summarize_results(&results);
    let quantile_indices = compute_quantile_indices(&results);
    log::debug!(
        "backtest finished: {} runs, success rate {:.3}",
        summary.total_runs,
        summary.success_rate
    );

    Ok(BacktestReport {
        series: series.bounds(),
        results,
        summary,
        quantile_indices,
    })
}

pub fn run_rolling_cohorts(
    config: &PolicyConfig,
    series: &HistoricalSeries,
) -> Result<Vec<SimulationRun>, BacktestError> {
    if config.retirement_years == 0 {
        return Err(BacktestError::Validation(
            "retirement_years must be > 0".to_string(),
        ));
    }

    let bounds = series.bounds();
    let max_years = bounds.span_years();
    if config.retirement_years > max_years {
        return Err(BacktestError::HorizonExceedsData {
            requested: config.retirement_years,
            max_years,
        });
    }

    let last_start_year = bounds.max_year - config.retirement_years as i32 + 1;
    // Indexed parallel iterator: collect keeps range order.
    (bounds.min_year..=last_start_year)
        .into_par_iter()
        .map(|start_year| simulate_start_year(config, series, start_year))
        .collect()
}

/// Withdrawals inflate from the second year on. A balance at or below zero
/// marks the run failed for good, but the replay still covers every year.
pub fn simulate_start_year(
    config: &PolicyConfig,
    series: &HistoricalSeries,
    start_year: i32,
) -> Result<SimulationRun, BacktestError> {
    let bounds = series.bounds();
    let last_year = i64::from(start_year) + i64::from(config.retirement_years) - 1;
    if config.retirement_years > 0 {
        if start_year < bounds.min_year {
            return Err(BacktestError::MissingYear { year: start_year });
        }
        if last_year > i64::from(bounds.max_year) {
            return Err(BacktestError::MissingYear {
                year: bounds.max_year + 1,
            });
        }
    }

    let years = config.retirement_years as usize;
    let mut yearly_balances = Vec::with_capacity(years + 1);
    let mut yearly_withdrawals = Vec::with_capacity(years);
    let mut yearly_fees = Vec::with_capacity(years);

    let mut portfolio = config.portfolio_start;
    yearly_balances.push(portfolio);
    let mut withdrawal_amount = portfolio * config.clamp_rate(config.withdrawal_rate_start);
    let mut failed = portfolio <= 0.0;

    for offset in 0..years {
        let year = start_year + offset as i32;
        let returns = series
            .returns(year)
            .ok_or(BacktestError::MissingYear { year })?;

        let stock_value = portfolio * config.stock_allocation * (1.0 + returns.stock_return);
        let bond_value = portfolio * config.bond_allocation * (1.0 + returns.bond_return);
        portfolio = stock_value + bond_value;

        let fee = if portfolio > 0.0 && config.management_fee > 0.0 {
            portfolio * config.management_fee
        } else {
            0.0
        };
        portfolio -= fee;
        yearly_fees.push(fee);

        if offset > 0 {
            withdrawal_amount *= 1.0 + config.inflation_rate;
        }
        if portfolio > 0.0 {
            withdrawal_amount = smoothed_withdrawal(config, portfolio, withdrawal_amount);
        }
        yearly_withdrawals.push(withdrawal_amount);

        portfolio = portfolio - withdrawal_amount + config.ss_annual_income(year);
        yearly_balances.push(portfolio);
        if portfolio <= 0.0 {
            failed = true;
        }
    }

    Ok(SimulationRun {
        start_year,
        success: !failed,
        ending_balance: portfolio,
        yearly_balances,
        yearly_withdrawals,
        yearly_fees,
        highlight: start_year == config.start_year,
    })
}

// `portfolio` must be > 0.
fn smoothed_withdrawal(config: &PolicyConfig, portfolio: f64, withdrawal_amount: f64) -> f64 {
    let target_rate = config.clamp_rate(withdrawal_amount / portfolio);
    let delta = portfolio * target_rate - withdrawal_amount;
    let smoothing = if delta >= 0.0 {
        config.withdrawal_smoothing_up
    } else {
        config.withdrawal_smoothing_down
    };
    withdrawal_amount + smoothing * delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{SsRecipient, YearReturns};
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn flat_series(first_year: i32, years: i32) -> HistoricalSeries {
        series_from_returns(first_year, &vec![(0.0, 0.0); years as usize])
    }

    fn series_from_returns(first_year: i32, returns: &[(f64, f64)]) -> HistoricalSeries {
        let rows = returns
            .iter()
            .enumerate()
            .map(|(idx, &(stock_return, bond_return))| YearReturns {
                year: first_year + idx as i32,
                stock_return,
                bond_return,
            })
            .collect();
        HistoricalSeries::from_rows(rows, "test").expect("contiguous series")
    }

    fn sample_config() -> PolicyConfig {
        PolicyConfig {
            start_year: 2000,
            retirement_years: 2,
            portfolio_start: 100.0,
            stock_allocation: 1.0,
            bond_allocation: 0.0,
            withdrawal_rate_start: 0.01,
            withdrawal_rate_min: 0.01,
            withdrawal_rate_max: 0.01,
            withdrawal_smoothing_up: 1.0,
            withdrawal_smoothing_down: 1.0,
            management_fee: 0.0,
            inflation_rate: 0.0,
            ss_recipients: Vec::new(),
        }
    }

    #[test]
    fn fee_is_taken_before_the_first_withdrawal() {
        let mut config = sample_config();
        config.management_fee = 0.1;

        let run = simulate_start_year(&config, &flat_series(2000, 2), 2000).expect("run");

        assert_eq!(run.yearly_withdrawals.len(), 2);
        assert_eq!(run.yearly_fees.len(), 2);
        assert_approx(run.yearly_fees[0], 10.0);
        assert_approx(run.yearly_withdrawals[0], 0.9);
        // Year two: 89.1 * 0.9 = 80.19 after fee, 1% of that withdrawn.
        assert_approx(run.yearly_fees[1], 8.91);
        assert_approx(run.yearly_withdrawals[1], 0.8019);
        assert_approx(run.ending_balance, 80.19 - 0.8019);
        assert!(run.success);
        assert!(run.highlight);
    }

    #[test]
    fn zero_fee_records_exact_zero_every_year() {
        let mut config = sample_config();
        config.retirement_years = 5;
        config.management_fee = 0.0;

        let run = simulate_start_year(&config, &flat_series(2000, 5), 2000).expect("run");
        assert!(run.yearly_fees.iter().all(|&fee| fee == 0.0));
    }

    #[test]
    fn fixed_rate_rederives_withdrawal_from_current_balance() {
        let mut config = sample_config();
        config.retirement_years = 3;
        config.withdrawal_rate_start = 0.04;
        config.withdrawal_rate_min = 0.04;
        config.withdrawal_rate_max = 0.04;

        let run = simulate_start_year(&config, &flat_series(2000, 3), 2000).expect("run");

        assert_approx(run.yearly_withdrawals[0], 4.0);
        assert_approx(run.yearly_withdrawals[1], 96.0 * 0.04);
        assert_approx(run.yearly_withdrawals[2], 96.0 * 0.96 * 0.04);
        assert_approx(run.yearly_balances[3], 100.0 * 0.96_f64.powi(3));
    }

    #[test]
    fn initial_rate_is_clamped_into_band() {
        let mut config = sample_config();
        config.retirement_years = 1;
        config.withdrawal_rate_start = 0.10;
        config.withdrawal_rate_min = 0.02;
        config.withdrawal_rate_max = 0.05;
        config.withdrawal_smoothing_up = 0.0;
        config.withdrawal_smoothing_down = 0.0;

        let run = simulate_start_year(&config, &flat_series(2000, 1), 2000).expect("run");
        assert_approx(run.yearly_withdrawals[0], 5.0);
    }

    #[test]
    fn returns_are_applied_per_asset_class() {
        let mut config = sample_config();
        config.retirement_years = 1;
        config.stock_allocation = 0.6;
        config.bond_allocation = 0.4;
        config.withdrawal_rate_start = 0.05;
        config.withdrawal_rate_min = 0.0;
        config.withdrawal_rate_max = 1.0;

        let series = series_from_returns(1990, &[(0.5, -0.25)]);
        let run = simulate_start_year(&config, &series, 1990).expect("run");

        // 60 * 1.5 + 40 * 0.75 = 120, withdrawal stays at 5 inside the band.
        assert_approx(run.yearly_withdrawals[0], 5.0);
        assert_approx(run.ending_balance, 115.0);
        assert!(!run.highlight);
    }

    #[test]
    fn inflation_applies_from_second_year_only() {
        let mut config = sample_config();
        config.retirement_years = 3;
        config.portfolio_start = 1_000.0;
        config.withdrawal_rate_start = 0.04;
        config.withdrawal_rate_min = 0.0;
        config.withdrawal_rate_max = 1.0;
        config.inflation_rate = 0.1;

        let run = simulate_start_year(&config, &flat_series(2000, 3), 2000).expect("run");

        assert_approx(run.yearly_withdrawals[0], 40.0);
        assert_approx(run.yearly_withdrawals[1], 44.0);
        assert_approx(run.yearly_withdrawals[2], 48.4);
    }

    #[test]
    fn zero_smoothing_up_ignores_band_driven_increase() {
        let mut config = sample_config();
        config.retirement_years = 2;
        config.portfolio_start = 1_000.0;
        config.withdrawal_rate_start = 0.04;
        config.withdrawal_rate_min = 0.04;
        config.withdrawal_rate_max = 0.10;
        config.inflation_rate = 0.02;
        config.withdrawal_smoothing_up = 0.0;

        // The boom drops the rate below the floor; only inflation moves it.
        let series = series_from_returns(2000, &[(0.0, 0.0), (1.0, 1.0)]);
        let run = simulate_start_year(&config, &series, 2000).expect("run");

        assert_approx(run.yearly_withdrawals[0], 40.0);
        assert_approx(run.yearly_withdrawals[1], 40.8);
    }

    #[test]
    fn full_smoothing_up_snaps_to_band_floor() {
        let mut config = sample_config();
        config.retirement_years = 2;
        config.portfolio_start = 1_000.0;
        config.withdrawal_rate_start = 0.04;
        config.withdrawal_rate_min = 0.04;
        config.withdrawal_rate_max = 0.10;
        config.inflation_rate = 0.02;

        let series = series_from_returns(2000, &[(0.0, 0.0), (1.0, 1.0)]);
        let run = simulate_start_year(&config, &series, 2000).expect("run");

        // (1000 - 40) * 2 = 1920, floor 4% -> 76.8.
        assert_approx(run.yearly_withdrawals[1], 76.8);
    }

    #[test]
    fn zero_smoothing_down_ignores_band_driven_decrease() {
        let mut config = sample_config();
        config.retirement_years = 2;
        config.portfolio_start = 1_000.0;
        config.withdrawal_rate_start = 0.05;
        config.withdrawal_rate_min = 0.01;
        config.withdrawal_rate_max = 0.05;
        config.inflation_rate = 0.02;
        config.withdrawal_smoothing_down = 0.0;

        let series = series_from_returns(2000, &[(0.0, 0.0), (-0.5, -0.5)]);
        let run = simulate_start_year(&config, &series, 2000).expect("run");

        assert_approx(run.yearly_withdrawals[1], 51.0);
    }

    #[test]
    fn partial_smoothing_down_moves_half_way() {
        let mut config = sample_config();
        config.retirement_years = 2;
        config.portfolio_start = 1_000.0;
        config.withdrawal_rate_start = 0.05;
        config.withdrawal_rate_min = 0.01;
        config.withdrawal_rate_max = 0.05;
        config.withdrawal_smoothing_down = 0.5;

        let series = series_from_returns(2000, &[(0.0, 0.0), (-0.5, -0.5)]);
        let run = simulate_start_year(&config, &series, 2000).expect("run");

        // Balance 950 * 0.5 = 475, cap 5% -> 23.75; halfway from 50 -> 36.875.
        assert_approx(run.yearly_withdrawals[1], 36.875);
    }

    #[test]
    fn failure_is_sticky_even_after_social_security_recovery() {
        let mut config = sample_config();
        config.retirement_years = 4;
        config.portfolio_start = 100.0;
        config.withdrawal_rate_start = 1.0;
        config.withdrawal_rate_min = 1.0;
        config.withdrawal_rate_max = 1.0;
        config.ss_recipients = vec![SsRecipient {
            start_year: 2002,
            monthly_amount: 100.0,
        }];

        let run = simulate_start_year(&config, &flat_series(2000, 4), 2000).expect("run");

        assert_approx(run.yearly_balances[1], 0.0);
        assert!(run.ending_balance > 0.0);
        assert!(!run.success);
        assert_eq!(run.yearly_balances.len(), 5);
        assert_eq!(run.yearly_withdrawals.len(), 4);
        assert_eq!(run.yearly_fees.len(), 4);
    }

    #[test]
    fn depleted_portfolio_keeps_inflated_withdrawal_and_skips_fee() {
        let mut config = sample_config();
        config.retirement_years = 3;
        config.portfolio_start = 100.0;
        config.withdrawal_rate_start = 0.6;
        config.withdrawal_rate_min = 0.6;
        config.withdrawal_rate_max = 0.6;
        config.inflation_rate = 0.1;
        config.management_fee = 0.01;

        let run = simulate_start_year(&config, &flat_series(2000, 3), 2000).expect("run");

        // Year one: 99 after fee, withdraw 59.4 -> 39.6.
        // Year two: 39.204 after fee, 59.4*1.1 = 65.34 clamps to 23.5224 -> 15.6816.
        // Year three: still positive, so the rule applies again.
        assert!(run.success);
        assert!(run.yearly_fees.iter().all(|&fee| fee > 0.0));

        config.withdrawal_rate_start = 1.0;
        config.withdrawal_rate_min = 1.0;
        config.withdrawal_rate_max = 1.0;
        config.management_fee = 0.0;
        let run = simulate_start_year(&config, &flat_series(2000, 3), 2000).expect("run");

        assert!(!run.success);
        assert_approx(run.yearly_withdrawals[0], 100.0);
        // Balance is zero from year two on: no rate correction, inflation only.
        assert_approx(run.yearly_withdrawals[1], 110.0);
        assert_approx(run.yearly_withdrawals[2], 121.0);
        assert_approx(run.yearly_fees[1], 0.0);
        assert_approx(run.ending_balance, -231.0);
    }

    #[test]
    fn social_security_is_a_step_function_without_inflation() {
        let mut config = sample_config();
        config.retirement_years = 3;
        config.portfolio_start = 1_000.0;
        config.withdrawal_rate_start = 0.0;
        config.withdrawal_rate_min = 0.0;
        config.withdrawal_rate_max = 0.0;
        config.inflation_rate = 0.05;
        config.ss_recipients = vec![
            SsRecipient {
                start_year: 2001,
                monthly_amount: 10.0,
            },
            SsRecipient {
                start_year: 2100,
                monthly_amount: 500.0,
            },
        ];

        let run = simulate_start_year(&config, &flat_series(2000, 3), 2000).expect("run");

        assert_approx(run.yearly_balances[1], 1_000.0);
        assert_approx(run.yearly_balances[2], 1_120.0);
        assert_approx(run.yearly_balances[3], 1_240.0);
    }

    #[test]
    fn non_positive_start_fails_but_still_runs_full_horizon() {
        let mut config = sample_config();
        config.retirement_years = 2;
        config.portfolio_start = 0.0;

        let run = simulate_start_year(&config, &flat_series(2000, 2), 2000).expect("run");

        assert!(!run.success);
        assert_eq!(run.yearly_balances.len(), 3);
        assert!(run.yearly_withdrawals.iter().all(|w| w.is_finite()));
    }

    #[test]
    fn missing_year_is_reported_instead_of_panicking() {
        let mut config = sample_config();
        config.retirement_years = 3;

        let err = simulate_start_year(&config, &flat_series(2000, 2), 2000).expect_err("gap");
        assert!(matches!(err, BacktestError::MissingYear { year: 2002 }));
    }

    #[test]
    fn oversized_horizon_is_rejected_before_replay() {
        let mut config = sample_config();
        config.retirement_years = u32::MAX;

        let err = simulate_start_year(&config, &flat_series(2000, 1), 2000).expect_err("too long");
        assert!(matches!(err, BacktestError::MissingYear { year: 2001 }));

        config.retirement_years = 1;
        let err = simulate_start_year(&config, &flat_series(2000, 1), 1999).expect_err("too early");
        assert!(matches!(err, BacktestError::MissingYear { year: 1999 }));
    }

    #[test]
    fn rolling_cohorts_cover_every_feasible_start_year_in_order() {
        let mut config = sample_config();
        config.start_year = 2003;
        config.retirement_years = 3;

        let runs = run_rolling_cohorts(&config, &flat_series(2000, 6)).expect("runs");

        let start_years = runs.iter().map(|r| r.start_year).collect::<Vec<_>>();
        assert_eq!(start_years, vec![2000, 2001, 2002, 2003]);
        let highlighted = runs.iter().filter(|r| r.highlight).collect::<Vec<_>>();
        assert_eq!(highlighted.len(), 1);
        assert_eq!(highlighted[0].start_year, 2003);
    }

    #[test]
    fn horizon_equal_to_span_yields_single_run() {
        let mut config = sample_config();
        config.retirement_years = 4;

        let runs = run_rolling_cohorts(&config, &flat_series(2000, 4)).expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_year, 2000);
    }

    #[test]
    fn horizon_longer_than_span_is_rejected() {
        let mut config = sample_config();
        config.retirement_years = 5;

        let err = run_rolling_cohorts(&config, &flat_series(2000, 4)).expect_err("too long");
        assert!(matches!(
            err,
            BacktestError::HorizonExceedsData {
                requested: 5,
                max_years: 4
            }
        ));
        assert!(err.is_user_error());
        assert!(err.to_string().contains("Max years available: 4"));
    }

    #[test]
    fn zero_horizon_is_a_validation_error() {
        let mut config = sample_config();
        config.retirement_years = 0;

        let err = run_rolling_cohorts(&config, &flat_series(2000, 4)).expect_err("zero");
        assert!(matches!(err, BacktestError::Validation(_)));
    }

    #[test]
    fn run_backtest_bundles_bounds_runs_summary_and_indices() {
        let mut config = sample_config();
        config.retirement_years = 2;

        let report = run_backtest(&config, &flat_series(1990, 5)).expect("report");

        assert_eq!(report.series.min_year, 1990);
        assert_eq!(report.series.max_year, 1994);
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.summary.total_runs, 4);
        assert!(!report.quantile_indices.is_empty());
        assert!(report.quantile_indices.iter().all(|&idx| idx < 4));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(48))]

        #[test]
        fn prop_trajectory_lengths_match_horizon(
            retirement_years in 1u32..30,
            extra_years in 0i32..10,
            stock_bp in -4000i32..6000,
            bond_bp in -500i32..1500,
            rate_bp in 1u32..2000,
            fee_bp in 0u32..300,
            inflation_bp in 0u32..800,
            smoothing_up_pct in 0u32..=100,
            smoothing_down_pct in 0u32..=100
        ) {
            let span = retirement_years as i32 + extra_years;
            let returns = (0..span)
                .map(|idx| {
                    let sign = if idx % 3 == 0 { -1.0 } else { 1.0 };
                    (sign * stock_bp as f64 / 10_000.0, bond_bp as f64 / 10_000.0)
                })
                .collect::<Vec<_>>();
            let series = series_from_returns(1950, &returns);

            let mut config = sample_config();
            config.retirement_years = retirement_years;
            config.portfolio_start = 1_000_000.0;
            config.stock_allocation = 0.6;
            config.bond_allocation = 0.4;
            config.withdrawal_rate_start = rate_bp as f64 / 10_000.0;
            config.withdrawal_rate_min = config.withdrawal_rate_start * 0.5;
            config.withdrawal_rate_max = (config.withdrawal_rate_start * 1.5).min(1.0);
            config.management_fee = fee_bp as f64 / 10_000.0;
            config.inflation_rate = inflation_bp as f64 / 10_000.0;
            config.withdrawal_smoothing_up = smoothing_up_pct as f64 / 100.0;
            config.withdrawal_smoothing_down = smoothing_down_pct as f64 / 100.0;

            let runs = run_rolling_cohorts(&config, &series).expect("feasible horizon");
            prop_assert_eq!(runs.len(), (extra_years + 1) as usize);
            for run in &runs {
                prop_assert_eq!(run.yearly_balances.len(), retirement_years as usize + 1);
                prop_assert_eq!(run.yearly_withdrawals.len(), retirement_years as usize);
                prop_assert_eq!(run.yearly_fees.len(), retirement_years as usize);
                prop_assert!(run.yearly_withdrawals.iter().all(|w| w.is_finite()));
                prop_assert!(run.yearly_fees.iter().all(|f| *f >= 0.0));
                let depleted = run.yearly_balances.iter().any(|b| *b <= 0.0);
                prop_assert_eq!(run.success, !depleted);
            }
        }

        #[test]
        fn prop_full_smoothing_keeps_rate_inside_band_while_solvent(
            retirement_years in 1u32..25,
            stock_bp in -3000i32..5000,
            min_bp in 100u32..500,
            width_bp in 0u32..500
        ) {
            let returns = (0..retirement_years as i32)
                .map(|idx| {
                    let bp = if idx % 2 == 0 { stock_bp } else { -stock_bp / 2 };
                    (bp as f64 / 10_000.0, 0.0)
                })
                .collect::<Vec<_>>();
            let series = series_from_returns(1900, &returns);

            let mut config = sample_config();
            config.retirement_years = retirement_years;
            config.portfolio_start = 500_000.0;
            config.withdrawal_rate_min = min_bp as f64 / 10_000.0;
            config.withdrawal_rate_max = (min_bp + width_bp) as f64 / 10_000.0;
            config.withdrawal_rate_start = config.withdrawal_rate_min;
            config.inflation_rate = 0.03;

            let run = simulate_start_year(&config, &series, 1900).expect("run");
            for (idx, withdrawal) in run.yearly_withdrawals.iter().enumerate() {
                let pre_withdrawal = run.yearly_balances[idx + 1] + withdrawal;
                if pre_withdrawal > 0.0 {
                    let rate = withdrawal / pre_withdrawal;
                    prop_assert!(rate >= config.withdrawal_rate_min - 1e-9);
                    prop_assert!(rate <= config.withdrawal_rate_max + 1e-9);
                }
            }
        }
    }
}
