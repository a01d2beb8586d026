use std::collections::BTreeMap;

use serde::Serialize;

use crate::record::TrialResult;

/// Critical value for chi-square with 1 degree of freedom at alpha = 0.05.
pub const CHI_SQUARE_CRITICAL_1DF: f64 = 3.841;

/// Per-level descriptive statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LevelSummary {
    pub count: usize,
    pub target_context_percent: f64,
    pub test_success_rate: f64,
    pub test_passed: usize,
    pub secret_score_mean: f64,
    pub secret_score_std: f64,
    pub hidden_score_mean: f64,
    pub hidden_rates: BTreeMap<String, f64>,
    pub response_time_mean: f64,
    pub function_rates: BTreeMap<String, f64>,
}

/// One side of a 2x2 pass/fail contingency table.
#[derive(Debug, Clone, Serialize)]
pub struct GroupRate {
    pub total: usize,
    pub passed: usize,
    pub rate: f64,
}

/// Chi-square comparison of pass rates between two levels (Yates-free).
#[derive(Debug, Clone, Serialize)]
pub struct ChiSquareResult {
    pub chi_square: f64,
    pub df: u32,
    pub significant: bool,
    pub level1: GroupRate,
    pub level2: GroupRate,
}

/// Welch's two-sample t-test over elapsed seconds, with Cohen's d.
#[derive(Debug, Clone, Serialize)]
pub struct WelchTResult {
    pub level1: String,
    pub level2: String,
    pub mean1: f64,
    pub mean2: f64,
    pub std1: f64,
    pub std2: f64,
    pub n1: usize,
    pub n2: usize,
    pub diff: f64,
    pub diff_pct: Option<f64>,
    pub t_stat: f64,
    pub df: f64,
    pub p_approx: f64,
    pub cohens_d: f64,
    pub significant: bool,
}

pub fn group_by_level(results: &[TrialResult]) -> BTreeMap<String, Vec<&TrialResult>> {
    let mut grouped: BTreeMap<String, Vec<&TrialResult>> = BTreeMap::new();
    for result in results {
        grouped
            .entry(result.context_level.clone())
            .or_default()
            .push(result);
    }
    grouped
}

/// Summary statistics for each context level. The per-declaration and
/// per-hidden-check rate maps are keyed by the union of keys observed in the
/// data, so rubric growth never leaves the summary stale.
pub fn calculate_summary(results: &[TrialResult]) -> BTreeMap<String, LevelSummary> {
    let grouped = group_by_level(results);
    let mut summary = BTreeMap::new();

    for (level, trials) in &grouped {
        let n = trials.len();
        if n == 0 {
            continue;
        }
        let nf = n as f64;

        let test_passed = trials.iter().filter(|t| t.test_passed).count();

        let secret_scores: Vec<f64> = trials.iter().map(|t| t.secret_score).collect();
        let secret_mean = secret_scores.iter().sum::<f64>() / nf;
        let secret_std = population_std(&secret_scores, secret_mean);

        let time_mean = trials.iter().map(|t| t.elapsed_seconds).sum::<f64>() / nf;
        let target_mean = trials
            .iter()
            .map(|t| t.target_context_percent)
            .sum::<f64>()
            / nf;
        let hidden_mean = trials.iter().map(|t| t.hidden_score).sum::<f64>() / nf;

        let function_rates = bool_map_rates(trials, |t| &t.func_results);
        let hidden_rates = bool_map_rates(trials, |t| &t.hidden_checks);

        summary.insert(
            level.clone(),
            LevelSummary {
                count: n,
                target_context_percent: round_to(target_mean, 1),
                test_success_rate: round_to(test_passed as f64 / nf, 4),
                test_passed,
                secret_score_mean: round_to(secret_mean, 4),
                secret_score_std: round_to(secret_std, 4),
                hidden_score_mean: round_to(hidden_mean, 4),
                hidden_rates,
                response_time_mean: round_to(time_mean, 2),
                function_rates,
            },
        );
    }

    summary
}

/// Chi-square test over the 2x2 pass/fail contingency table. Returns None
/// when either level is absent or empty, or when a margin is zero (all
/// trials passed, or all failed, across both groups) -- a degenerate table
/// with zero expected frequencies, not an insignificant one.
pub fn chi_square_test(
    results: &[TrialResult],
    level1: &str,
    level2: &str,
) -> Option<ChiSquareResult> {
    let grouped = group_by_level(results);
    let trials1 = grouped.get(level1)?;
    let trials2 = grouped.get(level2)?;

    let n1 = trials1.len();
    let n2 = trials2.len();
    if n1 == 0 || n2 == 0 {
        return None;
    }

    let pass1 = trials1.iter().filter(|t| t.test_passed).count();
    let pass2 = trials2.iter().filter(|t| t.test_passed).count();
    let fail1 = n1 - pass1;
    let fail2 = n2 - pass2;

    let total = (n1 + n2) as f64;
    let total_pass = (pass1 + pass2) as f64;
    let total_fail = (fail1 + fail2) as f64;
    if total_pass == 0.0 || total_fail == 0.0 {
        return None;
    }

    let expected = [
        (pass1 as f64, n1 as f64 * total_pass / total),
        (pass2 as f64, n2 as f64 * total_pass / total),
        (fail1 as f64, n1 as f64 * total_fail / total),
        (fail2 as f64, n2 as f64 * total_fail / total),
    ];
    let mut chi2 = 0.0;
    for (obs, exp) in expected {
        if exp > 0.0 {
            chi2 += (obs - exp) * (obs - exp) / exp;
        }
    }

    Some(ChiSquareResult {
        chi_square: round_to(chi2, 4),
        df: 1,
        significant: chi2 > CHI_SQUARE_CRITICAL_1DF,
        level1: GroupRate {
            total: n1,
            passed: pass1,
            rate: round_to(pass1 as f64 / n1 as f64, 4),
        },
        level2: GroupRate {
            total: n2,
            passed: pass2,
            rate: round_to(pass2 as f64 / n2 as f64, 4),
        },
    })
}

/// Welch's t-test over elapsed seconds. Returns None when either group has
/// fewer than two samples or the pooled standard error is exactly zero.
/// The two-tailed p-value uses the normal approximation erfc(|t|/sqrt 2),
/// adequate for moderate-to-large degrees of freedom.
pub fn welch_t_test(results: &[TrialResult], level1: &str, level2: &str) -> Option<WelchTResult> {
    let grouped = group_by_level(results);
    let times1: Vec<f64> = grouped.get(level1)?.iter().map(|t| t.elapsed_seconds).collect();
    let times2: Vec<f64> = grouped.get(level2)?.iter().map(|t| t.elapsed_seconds).collect();

    let n1 = times1.len();
    let n2 = times2.len();
    if n1 < 2 || n2 < 2 {
        return None;
    }

    let m1 = times1.iter().sum::<f64>() / n1 as f64;
    let m2 = times2.iter().sum::<f64>() / n2 as f64;
    let var1 = sample_variance(&times1, m1);
    let var2 = sample_variance(&times2, m2);

    let se = (var1 / n1 as f64 + var2 / n2 as f64).sqrt();
    if se == 0.0 {
        return None;
    }
    let t_stat = (m1 - m2) / se;

    // Welch-Satterthwaite degrees of freedom.
    let num = (var1 / n1 as f64 + var2 / n2 as f64).powi(2);
    let den = (var1 / n1 as f64).powi(2) / (n1 as f64 - 1.0)
        + (var2 / n2 as f64).powi(2) / (n2 as f64 - 1.0);
    let df = if den > 0.0 {
        num / den
    } else {
        (n1 + n2 - 2) as f64
    };

    let pooled_sd = ((var1 + var2) / 2.0).sqrt();
    let cohens_d = if pooled_sd > 0.0 {
        (m2 - m1).abs() / pooled_sd
    } else {
        0.0
    };

    let p_approx = erfc(t_stat.abs() / std::f64::consts::SQRT_2);

    Some(WelchTResult {
        level1: level1.to_string(),
        level2: level2.to_string(),
        mean1: round_to(m1, 1),
        mean2: round_to(m2, 1),
        std1: round_to(var1.sqrt(), 1),
        std2: round_to(var2.sqrt(), 1),
        n1,
        n2,
        diff: round_to(m2 - m1, 1),
        diff_pct: if m1 > 0.0 {
            Some(round_to((m2 - m1) / m1 * 100.0, 1))
        } else {
            None
        },
        t_stat: round_to(t_stat, 3),
        df: round_to(df, 1),
        p_approx: round_to(p_approx, 6),
        cohens_d: round_to(cohens_d, 2),
        significant: p_approx < 0.05,
    })
}

fn bool_map_rates<'a, F>(trials: &[&'a TrialResult], field: F) -> BTreeMap<String, f64>
where
    F: Fn(&'a TrialResult) -> &'a BTreeMap<String, bool>,
{
    let mut keys: Vec<&String> = Vec::new();
    for t in trials {
        for key in field(t).keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    let n = trials.len() as f64;
    let mut rates = BTreeMap::new();
    for key in keys {
        let hits = trials
            .iter()
            .filter(|t| field(t).get(key).copied().unwrap_or(false))
            .count();
        rates.insert(key.clone(), round_to(hits as f64 / n, 4));
    }
    rates
}

/// Population standard deviation; defined as 0 for groups of fewer than two
/// elements rather than NaN.
fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt()
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    let n = values.len() as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0)
}

/// Complementary error function via the Abramowitz-Stegun 7.1.26 rational
/// approximation (max absolute error 1.5e-7).
fn erfc(x: f64) -> f64 {
    if x < 0.0 {
        return 2.0 - erfc(-x);
    }
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    poly * (-x * x).exp()
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
