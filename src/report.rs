use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{TermKey, TermLeaderboard, TierCounts};
use crate::trend::Trend;

pub struct TierSummary {
    pub tier: Trend,
    pub count: u32,
    pub share: f64,
}

/// Totals per tier across every class, most common first.
pub fn summarize_by_tier(board: &TermLeaderboard) -> Vec<TierSummary> {
    let mut totals = TierCounts::default();
    for standing in &board.leaderboard {
        totals.absorb(&standing.counts);
    }
    let total: u32 = Trend::ALL.iter().map(|tier| totals.get(*tier)).sum();

    let mut summaries: Vec<TierSummary> = Trend::ALL
        .iter()
        .rev()
        .map(|tier| TierSummary {
            tier: *tier,
            count: totals.get(*tier),
            share: if total == 0 {
                0.0
            } else {
                f64::from(totals.get(*tier)) / f64::from(total)
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

pub fn build_report(term: TermKey, board: Option<&TermLeaderboard>, generated_at: DateTime<Utc>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Leaderboard Report");
    let _ = writeln!(
        output,
        "Generated for {} T{} on {}",
        term.year,
        term.term,
        generated_at.format("%Y-%m-%d")
    );

    let Some(board) = board else {
        let _ = writeln!(output);
        let _ = writeln!(output, "No leaderboard has been computed for this term.");
        return output;
    };

    let weeks: Vec<String> = board.weeks.iter().map(|w| format!("W{w}")).collect();
    let _ = writeln!(
        output,
        "Weeks considered: {}",
        if weeks.is_empty() {
            "none".to_string()
        } else {
            weeks.join(", ")
        }
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Tier Mix");

    let summaries = summarize_by_tier(board);
    if summaries.iter().all(|s| s.count == 0) {
        let _ = writeln!(output, "No trend labels recorded for this term.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- {}: {} students ({:.0}%)",
                summary.tier,
                summary.count,
                summary.share * 100.0
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Class Rankings");

    if board.leaderboard.is_empty() {
        let _ = writeln!(output, "No classes ranked yet.");
    } else {
        for (rank, standing) in board.leaderboard.iter().enumerate() {
            let _ = writeln!(
                output,
                "{}. {} {:.2} pts/student ({} raw, {} students; goat {}, diamond {}, gold {}, silver {})",
                rank + 1,
                standing.roll_id,
                standing.norm_points,
                standing.raw_points,
                standing.student_count,
                standing.counts.goat,
                standing.counts.diamond,
                standing.counts.gold,
                standing.counts.silver
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Points");

    if board.weeks.is_empty() {
        let _ = writeln!(output, "No weeks recorded for this term.");
    } else {
        for week in &board.weeks {
            let points: u32 = board
                .leaderboard
                .iter()
                .flat_map(|standing| standing.weeks.iter())
                .filter(|breakdown| breakdown.week == *week)
                .map(|breakdown| breakdown.points)
                .sum();
            let leader = board
                .leaderboard
                .iter()
                .filter_map(|standing| {
                    standing
                        .weeks
                        .iter()
                        .find(|breakdown| breakdown.week == *week)
                        .map(|breakdown| (standing.roll_id.as_str(), breakdown.points))
                })
                .filter(|(_, points)| *points > 0)
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)));
            match leader {
                Some((roll, best)) => {
                    let _ = writeln!(output, "- W{week}: {points} points, led by {roll} ({best})");
                }
                None => {
                    let _ = writeln!(output, "- W{week}: {points} points");
                }
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClassStanding, WeekBreakdown};

    fn standing(roll: &str, counts: TierCounts, students: u32, weeks: Vec<(u8, u32)>) -> ClassStanding {
        ClassStanding {
            roll_id: roll.to_string(),
            counts,
            raw_points: counts.points(),
            norm_points: if students == 0 {
                0.0
            } else {
                f64::from(counts.points()) / f64::from(students)
            },
            student_count: students,
            weeks: weeks
                .into_iter()
                .map(|(week, points)| WeekBreakdown {
                    week,
                    counts: TierCounts::default(),
                    points,
                })
                .collect(),
        }
    }

    fn sample_board() -> TermLeaderboard {
        TermLeaderboard {
            year: 2025,
            term: 2,
            weeks: vec![1, 2],
            leaderboard: vec![
                standing(
                    "10B",
                    TierCounts { silver: 0, gold: 1, diamond: 0, goat: 1 },
                    1,
                    vec![(1, 0), (2, 4)],
                ),
                standing(
                    "10A",
                    TierCounts { silver: 1, gold: 0, diamond: 1, goat: 0 },
                    2,
                    vec![(1, 0), (2, 2)],
                ),
            ],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn tier_mix_counts_every_class() {
        let summaries = summarize_by_tier(&sample_board());
        assert_eq!(summaries.len(), 4);
        assert!(summaries.iter().all(|s| s.count == 1));
        assert!((summaries[0].share - 0.25).abs() < 1e-9);
        // equal counts keep goat first
        assert_eq!(summaries[0].tier, Trend::Goat);
    }

    #[test]
    fn report_lists_rankings_and_weeks() {
        let term = TermKey::new(2025, 2).unwrap();
        let report = build_report(term, Some(&sample_board()), Utc::now());
        assert!(report.starts_with("# Attendance Leaderboard Report"));
        assert!(report.contains("Weeks considered: W1, W2"));
        assert!(report.contains("1. 10B 4.00 pts/student"));
        assert!(report.contains("2. 10A 1.00 pts/student"));
        assert!(report.contains("- W1: 0 points\n"));
        assert!(report.contains("- W2: 6 points, led by 10B (4)"));
    }

    #[test]
    fn missing_board_is_reported() {
        let term = TermKey::new(2025, 1).unwrap();
        let report = build_report(term, None, Utc::now());
        assert!(report.contains("No leaderboard has been computed"));
    }
}
