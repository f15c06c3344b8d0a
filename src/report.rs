use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::StatsReport;

fn score_text(score: Option<f64>) -> String {
    score
        .map(|value| format!("{value:.1}"))
        .unwrap_or_else(|| "n/a".to_string())
}

pub fn build_report(stats: &StatsReport, generated_at: DateTime<Utc>) -> String {
    let mut output = String::new();
    let overall = &stats.overall;

    let _ = writeln!(output, "# OrderLog Monthly Report");
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Overview");
    let _ = writeln!(
        output,
        "- Average score (last 3 months): {}",
        score_text(overall.avg_score_3months)
    );
    let _ = writeln!(output, "- Users: {}", overall.total_users);
    let _ = writeln!(output, "- Submissions (all time): {}", overall.total_submissions);
    let _ = writeln!(
        output,
        "- Active users (last 3 months): {}",
        overall.active_users_3months
    );

    let distribution = &stats.score_distribution;
    let _ = writeln!(output);
    let _ = writeln!(output, "## Score Mix (last 3 months)");
    if distribution.total() == 0 {
        let _ = writeln!(output, "No scored submissions in this window.");
    } else {
        let _ = writeln!(output, "- Excellent (90+): {}", distribution.excellent);
        let _ = writeln!(output, "- Good (80-89): {}", distribution.good);
        let _ = writeln!(output, "- Fair (70-79): {}", distribution.fair);
        let _ = writeln!(
            output,
            "- Needs improvement (<70): {}",
            distribution.needs_improvement
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Monthly Trend");
    let _ = writeln!(output, "| Month | Submissions | Avg score |");
    let _ = writeln!(output, "|---|---|---|");
    for (count, average) in stats
        .monthly_submissions
        .iter()
        .zip(stats.monthly_avg_scores.iter())
    {
        let _ = writeln!(
            output,
            "| {} | {} | {} |",
            count.year_month,
            count.count,
            score_text(average.avg_score)
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Performers");
    if stats.top_performers.is_empty() {
        let _ = writeln!(output, "No scored submissions in this window.");
    } else {
        for (rank, performer) in stats.top_performers.iter().enumerate() {
            let _ = writeln!(
                output,
                "{}. {} ({}) avg {:.1}",
                rank + 1,
                performer.display_name,
                performer.department.as_deref().unwrap_or("no department"),
                performer.avg_score
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Needs Follow-up");
    if stats.low_submission_users.is_empty() {
        let _ = writeln!(output, "Everyone submitted at least twice in the last 3 months.");
    } else {
        for user in stats.low_submission_users.iter() {
            let _ = writeln!(
                output,
                "- {} ({}): {} submission(s)",
                user.display_name,
                user.department.as_deref().unwrap_or("no department"),
                user.submission_count_3months
            );
        }
    }

    output
}
