use std::fmt::Write;

use crate::record::TrialResult;
use crate::stats::{calculate_summary, chi_square_test, welch_t_test};

const RULE: &str = "======================================================================";
const BAR_CELLS: usize = 20;

/// Render the full text report: per-level summary table, per-declaration and
/// per-hidden-check bar charts, and pairwise statistical tests.
pub fn generate_report(results: &[TrialResult]) -> String {
    let summary = calculate_summary(results);
    let mut out = String::new();

    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "Context consumption experiment - results report");
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out);
    let _ = writeln!(out, "[Per-level summary]");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<8} {:>4} {:>8} {:>10} {:>8} {:>8} {:>8}",
        "Level", "N", "Target", "Pass Rate", "Secret", "Hidden", "Time"
    );
    let _ = writeln!(out, "{}", "-".repeat(70));

    for (level, s) in &summary {
        let _ = writeln!(
            out,
            "{:<8} {:>4} {:>7.1}% {:>9} {:>8.2} {:>8.2} {:>7.1}s",
            level,
            s.count,
            s.target_context_percent,
            percent(s.test_success_rate),
            s.secret_score_mean,
            s.hidden_score_mean,
            s.response_time_mean
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "[Per-function success rates]");
    let _ = writeln!(out);
    for (level, s) in &summary {
        let _ = writeln!(out, "{}:", level);
        for (func, rate) in &s.function_rates {
            let _ = writeln!(out, "  {:<24} {} {}", func, bar(*rate), percent(*rate));
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "[Hidden instruction compliance]");
    let _ = writeln!(out);
    let _ = writeln!(out, "Instructions embedded mid-specification:");
    let _ = writeln!(out);
    for (level, s) in &summary {
        let _ = writeln!(out, "{}:", level);
        for (check, rate) in &s.hidden_rates {
            let _ = writeln!(out, "  {:<28} {} {}", check, bar(*rate), percent(*rate));
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "[Statistical tests]");
    let _ = writeln!(out);

    let levels: Vec<&String> = summary.keys().collect();
    for i in 0..levels.len() {
        for j in (i + 1)..levels.len() {
            let (l1, l2) = (levels[i], levels[j]);
            let _ = writeln!(out, "{} vs {}:", l1, l2);

            match chi_square_test(results, l1, l2) {
                Some(chi) => {
                    let _ = writeln!(
                        out,
                        "  pass rate: {}={}, {}={}",
                        l1,
                        percent(chi.level1.rate),
                        l2,
                        percent(chi.level2.rate)
                    );
                    let verdict = if chi.significant {
                        "significant"
                    } else {
                        "not significant"
                    };
                    let _ = writeln!(
                        out,
                        "  chi-square = {:.4}, {} (alpha = 0.05)",
                        chi.chi_square, verdict
                    );
                }
                None => {
                    let _ = writeln!(out, "  pass rate: no difference (degenerate table)");
                }
            }

            if let Some(t) = welch_t_test(results, l1, l2) {
                let _ = writeln!(
                    out,
                    "  elapsed: {}={:.1}s (SD={:.1}), {}={:.1}s (SD={:.1})",
                    l1, t.mean1, t.std1, l2, t.mean2, t.std2
                );
                let sign = if t.diff >= 0.0 { "+" } else { "" };
                let pct = match t.diff_pct {
                    Some(p) => format!(" ({}{:.1}%)", sign, p),
                    None => String::new(),
                };
                let _ = writeln!(out, "  diff: {}{:.1}s{}", sign, t.diff, pct);
                let verdict = if t.significant {
                    "significant"
                } else {
                    "not significant"
                };
                let _ = writeln!(
                    out,
                    "  Welch's t={:.3}, df={:.1}, p~{:.4} -> {}",
                    t.t_stat, t.df, t.p_approx, verdict
                );
                let _ = writeln!(out, "  Cohen's d={:.2}", t.cohens_d);
            }

            let _ = writeln!(out);
        }
    }

    let _ = writeln!(out, "{}", RULE);
    out
}

fn bar(rate: f64) -> String {
    let filled = ((rate * BAR_CELLS as f64) as usize).min(BAR_CELLS);
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_CELLS - filled))
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}
