use super::types::{PercentileMap, SimulationRun, Summary};

const HEADLINE_PERCENTILES: [f64; 3] = [10.0, 50.0, 90.0];
const QUARTILE_PERCENTILES: [f64; 5] = [0.0, 25.0, 50.0, 75.0, 100.0];
const REPRESENTATIVE_QUANTILES: [f64; 5] = [0.0, 0.25, 0.5, 0.75, 1.0];

pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();

    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 100.0 {
        return sorted[n - 1];
    }

    let rank = (n as f64 - 1.0) * (p / 100.0);
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(n - 1);
    if lower == upper {
        return sorted[lower];
    }
    sorted[lower] * (upper as f64 - rank) + sorted[upper] * (rank - lower as f64)
}

fn percentile_map(values: &[f64], percentiles: &[f64]) -> PercentileMap {
    percentiles
        .iter()
        .map(|&p| (format!("p{p:.0}"), percentile(values, p)))
        .collect()
}

pub fn summarize_results(results: &[SimulationRun]) -> Summary {
    if results.is_empty() {
        return Summary {
            total_runs: 0,
            success_count: 0,
            failure_count: 0,
            success_rate: 0.0,
            ending_balance_percentiles: PercentileMap::new(),
            portfolio_quantiles: PercentileMap::new(),
            spending_quantiles: PercentileMap::new(),
            fee_quantiles: PercentileMap::new(),
        };
    }

    let total_runs = results.len();
    let success_count = results.iter().filter(|run| run.success).count();
    let ending_balances = results
        .iter()
        .map(|run| run.ending_balance)
        .collect::<Vec<_>>();
    let total_spending = results
        .iter()
        .map(SimulationRun::total_withdrawals)
        .collect::<Vec<_>>();
    let total_fees = results
        .iter()
        .map(SimulationRun::total_fees)
        .collect::<Vec<_>>();

    Summary {
        total_runs,
        success_count,
        failure_count: total_runs - success_count,
        success_rate: success_count as f64 / total_runs as f64,
        ending_balance_percentiles: percentile_map(&ending_balances, &HEADLINE_PERCENTILES),
        portfolio_quantiles: percentile_map(&ending_balances, &QUARTILE_PERCENTILES),
        spending_quantiles: percentile_map(&total_spending, &QUARTILE_PERCENTILES),
        fee_quantiles: percentile_map(&total_fees, &QUARTILE_PERCENTILES),
    }
}

/// Positions of the runs sitting at the 0/25/50/75/100th percentile, by
/// ending balance and by total withdrawals.
///
/// Ties sort by position. Ranks round half to even: with three runs the
/// quartile ranks 0.5 and 1.5 land on 0 and 2. The two selections are merged,
/// deduplicated and sorted.
pub fn compute_quantile_indices(results: &[SimulationRun]) -> Vec<usize> {
    if results.is_empty() {
        return Vec::new();
    }

    let ending_balances = results
        .iter()
        .map(|run| run.ending_balance)
        .collect::<Vec<_>>();
    let total_spending = results
        .iter()
        .map(SimulationRun::total_withdrawals)
        .collect::<Vec<_>>();

    let mut indices = representative_positions(&ending_balances);
    indices.extend(representative_positions(&total_spending));
    indices.sort_unstable();
    indices.dedup();
    indices
}

fn representative_positions(values: &[f64]) -> Vec<usize> {
    let mut ranked = values.iter().copied().enumerate().collect::<Vec<_>>();
    ranked.sort_by(|(ia, a), (ib, b)| a.total_cmp(b).then(ia.cmp(ib)));

    let last = (ranked.len() - 1) as f64;
    REPRESENTATIVE_QUANTILES
        .iter()
        .map(|q| ranked[(q * last).round_ties_even() as usize].0)
        .collect()
}
