use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::leaderboard::Leaderboards;
use crate::models::{AttendanceRow, ClassStanding, TermKey, TrendMeta};
use crate::roster::Roster;
use crate::snapshots::{SnapshotRecord, SnapshotStore};
use crate::trend::Trend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermSummary {
    pub year: u16,
    pub term: u8,
    pub weeks: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupRow {
    pub external_id: String,
    pub week_values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRollup {
    pub year: u16,
    pub term: u8,
    pub roll_class: String,
    pub weeks: Vec<u8>,
    pub rows: Vec<RollupRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardView {
    pub weeks: Vec<u8>,
    pub leaderboard: Vec<ClassStanding>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMeta {
    pub snapshot_id: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub year: Option<u16>,
    pub term: Option<u8>,
    pub week: Option<u8>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRow {
    pub external_id: String,
    pub pct_present: f64,
    pub trend: Option<Trend>,
    pub trend_meta: Option<TrendMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestClassRows {
    pub snapshot_id: Option<String>,
    pub label: Option<String>,
    pub roll_class: String,
    pub rows: Vec<ClassRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub external_id: String,
    pub roll_class: Option<String>,
    pub term: Option<String>,
    pub term_percent: Option<f64>,
    pub ytd_percent: Option<f64>,
    pub trend: Option<Trend>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentWeek {
    pub week: u8,
    pub label: String,
    pub pct_present: Option<f64>,
    pub trend: Option<Trend>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTerm {
    pub external_id: String,
    pub year: u16,
    pub term: u8,
    pub weeks: Vec<StudentWeek>,
}

#[derive(Clone)]
pub struct Queries {
    snapshots: SnapshotStore,
    leaderboards: Leaderboards,
    roster: Roster,
}

impl Queries {
    pub fn new(snapshots: SnapshotStore, leaderboards: Leaderboards, roster: Roster) -> Self {
        Self {
            snapshots,
            leaderboards,
            roster,
        }
    }

    pub async fn list_terms(&self) -> anyhow::Result<Vec<TermSummary>> {
        let records = self
            .snapshots
            .list_all()
            .await
            .context("failed to list snapshots")?;
        let mut terms: BTreeMap<TermKey, Vec<u8>> = BTreeMap::new();
        for record in records {
            terms
                .entry(record.snapshot.key().term_key())
                .or_default()
                .push(record.snapshot.week);
        }
        Ok(terms
            .into_iter()
            .rev()
            .map(|(key, weeks)| TermSummary {
                year: key.year,
                term: key.term,
                weeks,
            })
            .collect())
    }

    pub async fn term_classes(&self, term: TermKey) -> anyhow::Result<Vec<String>> {
        let classes: BTreeSet<String> = self
            .term_snapshots(term)
            .await?
            .into_iter()
            .flat_map(|record| record.snapshot.class_list)
            .collect();
        Ok(classes.into_iter().collect())
    }

    pub async fn class_rollup(&self, term: TermKey, roll_class: &str) -> anyhow::Result<ClassRollup> {
        let records = self.term_snapshots(term).await?;
        let weeks: Vec<u8> = records.iter().map(|r| r.snapshot.week).collect();

        let mut students: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            let rows = self
                .snapshots
                .rows_for_class(&record.id, roll_class)
                .await
                .with_context(|| format!("failed to load rows of snapshot {}", record.id))?;
            for row in rows {
                let values = students
                    .entry(row.external_id)
                    .or_insert_with(|| vec![None; weeks.len()]);
                values[idx] = Some(row.pct_present);
            }
        }

        Ok(ClassRollup {
            year: term.year,
            term: term.term,
            roll_class: roll_class.to_string(),
            weeks,
            rows: students
                .into_iter()
                .map(|(external_id, week_values)| RollupRow {
                    external_id,
                    week_values,
                })
                .collect(),
        })
    }

    /// The stored leaderboard, or an empty one if the term was never computed.
    pub async fn leaderboard(&self, term: TermKey) -> anyhow::Result<LeaderboardView> {
        let board = self
            .leaderboards
            .fetch(term)
            .await
            .with_context(|| format!("failed to load leaderboard {}", term.doc_id()))?;
        Ok(match board {
            Some(board) => LeaderboardView {
                weeks: board.weeks,
                leaderboard: board.leaderboard,
            },
            None => LeaderboardView {
                weeks: Vec::new(),
                leaderboard: Vec::new(),
            },
        })
    }

    pub async fn latest_meta(&self) -> anyhow::Result<LatestMeta> {
        let Some(record) = self.latest().await? else {
            return Ok(LatestMeta::default());
        };
        Ok(LatestMeta {
            uploaded_at: Some(record.snapshot.updated_at),
            year: Some(record.snapshot.year),
            term: Some(record.snapshot.term),
            week: Some(record.snapshot.week),
            label: Some(record.snapshot.label),
            snapshot_id: Some(record.id),
        })
    }

    pub async fn latest_class_rows(&self, roll_class: &str) -> anyhow::Result<LatestClassRows> {
        let Some(record) = self.latest().await? else {
            return Ok(LatestClassRows {
                snapshot_id: None,
                label: None,
                roll_class: roll_class.to_string(),
                rows: Vec::new(),
            });
        };
        let mut rows: Vec<ClassRow> = self
            .snapshots
            .rows_for_class(&record.id, roll_class)
            .await
            .context("failed to load class rows")?
            .into_iter()
            .map(|row| ClassRow {
                external_id: row.external_id,
                pct_present: row.pct_present,
                trend: row.trend,
                trend_meta: row.trend_meta,
            })
            .collect();
        rows.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(LatestClassRows {
            snapshot_id: Some(record.id),
            label: Some(record.snapshot.label),
            roll_class: roll_class.to_string(),
            rows,
        })
    }

    pub async fn student_summary(&self, external_id: &str) -> anyhow::Result<StudentSummary> {
        let roster_entry = self
            .roster
            .lookup(external_id)
            .await
            .context("failed to look up roster entry")?;
        let mut summary = StudentSummary {
            external_id: external_id.to_string(),
            roll_class: roster_entry.map(|entry| entry.roll_class),
            term: None,
            term_percent: None,
            ytd_percent: None,
            trend: None,
            updated_at: None,
        };
        let Some(latest) = self.latest().await? else {
            return Ok(summary);
        };
        let term = latest.snapshot.key().term_key();

        let mut term_values = Vec::new();
        let mut year_values = Vec::new();
        let mut newest: Option<(SnapshotRecord, AttendanceRow)> = None;
        for record in self.snapshots.list_all().await.context("failed to list snapshots")? {
            if record.snapshot.year != term.year || record.snapshot.key() > latest.snapshot.key() {
                continue;
            }
            let Some(row) = self
                .snapshots
                .row(&record.id, external_id)
                .await
                .context("failed to load student row")?
            else {
                continue;
            };
            year_values.push(row.pct_present);
            if record.snapshot.term == term.term {
                term_values.push(row.pct_present);
                newest = Some((record, row));
            }
        }

        summary.term = Some(format!("{} T{}", term.year, term.term));
        summary.term_percent = mean(&term_values);
        summary.ytd_percent = mean(&year_values);
        if let Some((record, row)) = newest {
            summary.roll_class = summary.roll_class.or(Some(row.roll_class));
            summary.trend = row.trend;
            summary.updated_at = Some(record.snapshot.updated_at);
        }
        Ok(summary)
    }

    pub async fn student_term(&self, external_id: &str, term: TermKey) -> anyhow::Result<StudentTerm> {
        let mut weeks = Vec::new();
        for record in self.term_snapshots(term).await? {
            let row = self
                .snapshots
                .row(&record.id, external_id)
                .await
                .context("failed to load student row")?;
            weeks.push(StudentWeek {
                week: record.snapshot.week,
                label: record.snapshot.label,
                pct_present: row.as_ref().map(|r| r.pct_present),
                trend: row.and_then(|r| r.trend),
            });
        }
        Ok(StudentTerm {
            external_id: external_id.to_string(),
            year: term.year,
            term: term.term,
            weeks,
        })
    }

    async fn term_snapshots(&self, term: TermKey) -> anyhow::Result<Vec<SnapshotRecord>> {
        self.snapshots
            .list_term(term)
            .await
            .with_context(|| format!("failed to list snapshots for {} T{}", term.year, term.term))
    }

    async fn latest(&self) -> anyhow::Result<Option<SnapshotRecord>> {
        self.snapshots
            .latest()
            .await
            .context("failed to resolve latest snapshot")
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{Ingestor, UploadRequest};
    use crate::leaderboard::Exclusions;
    use crate::models::RosterEntry;
    use crate::store::memory::MemoryStore;
    use crate::store::SchoolPaths;
    use std::sync::Arc;

    struct Fixture {
        ingestor: Ingestor,
        queries: Queries,
        roster: Roster,
    }

    fn fixture() -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let paths = SchoolPaths::new("q");
        let snapshots = SnapshotStore::new(memory.clone(), paths.clone());
        let leaderboards = Leaderboards::new(memory.clone(), paths.clone(), Exclusions::default());
        let roster = Roster::new(memory.clone(), paths.clone());
        Fixture {
            ingestor: Ingestor::new(memory, paths, Exclusions::default()),
            queries: Queries::new(snapshots, leaderboards, roster.clone()),
            roster,
        }
    }

    async fn upload(fx: &Fixture, year: i64, term: i64, week: i64, csv: &str) {
        fx.ingestor
            .ingest(UploadRequest {
                filename: "export.csv".to_string(),
                bytes: Some(csv.as_bytes().to_vec()),
                year,
                term,
                week,
                uploaded_by: "test".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terms_are_listed_newest_first() {
        let fx = fixture();
        upload(&fx, 2025, 1, 2, "id,roll,pct\nS1,10A,90\n").await;
        upload(&fx, 2025, 1, 1, "id,roll,pct\nS1,10A,80\n").await;
        upload(&fx, 2025, 2, 1, "id,roll,pct\nS1,10A,85\n").await;

        let terms = fx.queries.list_terms().await.unwrap();
        assert_eq!(
            terms,
            vec![
                TermSummary { year: 2025, term: 2, weeks: vec![1] },
                TermSummary { year: 2025, term: 1, weeks: vec![1, 2] },
            ]
        );
    }

    #[tokio::test]
    async fn rollup_leaves_gaps_for_missing_weeks() {
        let fx = fixture();
        upload(&fx, 2025, 1, 1, "id,roll,pct\nS1,10A,80\nS2,10A,70\nS3,10B,60\n").await;
        upload(&fx, 2025, 1, 3, "id,roll,pct\nS1,10A,85\nS3,10B,65\n").await;
        let term = TermKey::new(2025, 1).unwrap();

        let classes = fx.queries.term_classes(term).await.unwrap();
        assert_eq!(classes, vec!["10A", "10B"]);

        let rollup = fx.queries.class_rollup(term, "10A").await.unwrap();
        assert_eq!(rollup.weeks, vec![1, 3]);
        assert_eq!(rollup.rows.len(), 2);
        assert_eq!(rollup.rows[0].week_values, vec![Some(80.0), Some(85.0)]);
        assert_eq!(rollup.rows[1].external_id, "S2");
        assert_eq!(rollup.rows[1].week_values, vec![Some(70.0), None]);

        let json = serde_json::to_value(&rollup).unwrap();
        assert_eq!(json["rollClass"], "10A");
        assert!(json["rows"][1]["weekValues"][1].is_null());
    }

    #[tokio::test]
    async fn empty_store_yields_empty_views() {
        let fx = fixture();
        assert_eq!(fx.queries.latest_meta().await.unwrap(), LatestMeta::default());
        let board = fx.queries.leaderboard(TermKey::new(2025, 1).unwrap()).await.unwrap();
        assert!(board.weeks.is_empty());
        assert!(board.leaderboard.is_empty());
        let rows = fx.queries.latest_class_rows("10A").await.unwrap();
        assert!(rows.snapshot_id.is_none());
    }

    #[tokio::test]
    async fn latest_views_follow_the_pointer() {
        let fx = fixture();
        upload(&fx, 2025, 1, 1, "id,roll,pct\nS2,10A,70\nS1,10A,80\n").await;
        upload(&fx, 2025, 1, 2, "id,roll,pct\nS2,10A,60\nS1,10A,80\n").await;

        let meta = fx.queries.latest_meta().await.unwrap();
        assert_eq!(meta.week, Some(2));
        assert_eq!(meta.label.as_deref(), Some("2025 T1 W2"));

        let class = fx.queries.latest_class_rows("10A").await.unwrap();
        let ids: Vec<_> = class.rows.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S2"]);
        assert_eq!(class.rows[0].trend, Some(Trend::Gold));
        assert_eq!(class.rows[1].trend, Some(Trend::Silver));
    }

    #[tokio::test]
    async fn student_views_average_their_weeks() {
        let fx = fixture();
        fx.roster
            .replace(&[RosterEntry {
                external_id: "S1".to_string(),
                roll_class: "10A".to_string(),
                email: None,
            }])
            .await
            .unwrap();
        upload(&fx, 2025, 1, 1, "id,roll,pct\nS1,10A,60\n").await;
        upload(&fx, 2025, 2, 1, "id,roll,pct\nS1,10A,80\n").await;
        upload(&fx, 2025, 2, 3, "id,roll,pct\nS1,10A,100\n").await;

        let summary = fx.queries.student_summary("S1").await.unwrap();
        assert_eq!(summary.roll_class.as_deref(), Some("10A"));
        assert_eq!(summary.term.as_deref(), Some("2025 T2"));
        assert_eq!(summary.term_percent, Some(90.0));
        assert_eq!(summary.ytd_percent, Some(80.0));
        assert_eq!(summary.trend, Some(Trend::Diamond));

        let weeks = fx
            .queries
            .student_term("S1", TermKey::new(2025, 2).unwrap())
            .await
            .unwrap();
        let values: Vec<_> = weeks.weeks.iter().map(|w| (w.week, w.pct_present)).collect();
        assert_eq!(values, vec![(1, Some(80.0)), (3, Some(100.0))]);

        let unknown = fx.queries.student_summary("nobody").await.unwrap();
        assert_eq!(unknown.term_percent, None);
        assert_eq!(unknown.roll_class, None);
    }
}
