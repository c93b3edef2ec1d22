use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{
    AttendanceRow, ClassStanding, TermKey, TermLeaderboard, TierCounts, WeekBreakdown,
    MAX_TERM_WEEKS,
};
use crate::roster::Roster;
use crate::snapshots::SnapshotStore;
use crate::store::{commit_chunked, decode_value, encode_value, DocumentStore, SchoolPaths, WriteOp};

pub const DEFAULT_EXCLUDED_ROLLS: &[&str] = &["ADMIN", "STAFF", "OFFICE", "EXIT", "LEFT", "UNASSIGNED"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusions {
    rolls: HashSet<String>,
}

impl Default for Exclusions {
    fn default() -> Self {
        Self::with_extra(std::iter::empty::<String>())
    }
}

impl Exclusions {
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rolls = DEFAULT_EXCLUDED_ROLLS
            .iter()
            .map(|roll| roll.to_string())
            .chain(extra.into_iter().map(|roll| canonical(roll.as_ref())))
            .filter(|roll| !roll.is_empty())
            .collect();
        Self { rolls }
    }

    pub fn is_excluded(&self, roll_class: &str) -> bool {
        self.rolls.contains(&canonical(roll_class))
    }
}

fn canonical(roll: &str) -> String {
    roll.trim().to_uppercase()
}

#[derive(Debug, Clone)]
pub struct WeekRows {
    pub week: u8,
    pub rows: Vec<AttendanceRow>,
}

#[derive(Default)]
struct Tally {
    counts: TierCounts,
    by_week: BTreeMap<u8, TierCounts>,
}

/// A class missing from `student_counts` keeps its raw points and scores
/// zero normalized points.
pub fn aggregate(
    term: TermKey,
    mut weeks: Vec<WeekRows>,
    student_counts: &HashMap<String, u32>,
    exclusions: &Exclusions,
    now: DateTime<Utc>,
) -> TermLeaderboard {
    weeks.sort_by_key(|w| w.week);
    weeks.truncate(usize::from(MAX_TERM_WEEKS));
    let considered: Vec<u8> = weeks.iter().map(|w| w.week).collect();

    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
    for week in &weeks {
        for row in &week.rows {
            let Some(trend) = row.trend else {
                continue;
            };
            if exclusions.is_excluded(&row.roll_class) {
                continue;
            }
            let tally = tallies.entry(row.roll_class.clone()).or_default();
            tally.counts.record(trend);
            tally.by_week.entry(week.week).or_default().record(trend);
        }
    }

    let mut leaderboard: Vec<ClassStanding> = tallies
        .into_iter()
        .map(|(roll_id, tally)| {
            let raw_points = tally.counts.points();
            let student_count = student_counts.get(&roll_id).copied().unwrap_or(0);
            let norm_points = if student_count == 0 {
                0.0
            } else {
                f64::from(raw_points) / f64::from(student_count)
            };
            let weeks = considered
                .iter()
                .map(|week| {
                    let counts = tally.by_week.get(week).copied().unwrap_or_default();
                    WeekBreakdown {
                        week: *week,
                        points: counts.points(),
                        counts,
                    }
                })
                .collect();
            ClassStanding {
                roll_id,
                counts: tally.counts,
                raw_points,
                norm_points,
                student_count,
                weeks,
            }
        })
        .collect();

    leaderboard.sort_by(|a, b| {
        b.norm_points
            .partial_cmp(&a.norm_points)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    TermLeaderboard {
        year: term.year,
        term: term.term,
        weeks: considered,
        leaderboard,
        updated_at: now,
    }
}

#[derive(Clone)]
pub struct Leaderboards {
    store: Arc<dyn DocumentStore>,
    paths: SchoolPaths,
    exclusions: Exclusions,
}

impl Leaderboards {
    pub fn new(store: Arc<dyn DocumentStore>, paths: SchoolPaths, exclusions: Exclusions) -> Self {
        Self {
            store,
            paths,
            exclusions,
        }
    }

    pub async fn recompute(
        &self,
        snapshots: &SnapshotStore,
        roster: &Roster,
        term: TermKey,
    ) -> Result<TermLeaderboard, StoreError> {
        let mut records = snapshots.list_term(term).await?;
        records.truncate(usize::from(MAX_TERM_WEEKS));

        let mut weeks = Vec::with_capacity(records.len());
        for record in records {
            let rows = snapshots.rows(&record.id).await?;
            debug!(week = record.snapshot.week, rows = rows.len(), "week loaded for leaderboard");
            weeks.push(WeekRows {
                week: record.snapshot.week,
                rows,
            });
        }

        let counts = roster.class_counts().await?;
        let board = aggregate(term, weeks, &counts, &self.exclusions, Utc::now());

        let path = self.paths.leaderboard(term);
        let data = encode_value(&path, &board)?;
        commit_chunked(self.store.as_ref(), vec![WriteOp::Set { path, data }]).await?;
        info!(
            year = term.year,
            term = term.term,
            weeks = board.weeks.len(),
            classes = board.leaderboard.len(),
            "leaderboard recomputed"
        );
        Ok(board)
    }

    pub async fn fetch(&self, term: TermKey) -> Result<Option<TermLeaderboard>, StoreError> {
        let path = self.paths.leaderboard(term);
        self.store
            .get(&path)
            .await?
            .map(|data| decode_value(&path, data))
            .transpose()
    }
}
