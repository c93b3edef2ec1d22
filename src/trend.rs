use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::models::{TermKey, TrendMeta};
use crate::snapshots::{RowTrend, SnapshotRecord, SnapshotStore};

/// Changes within this many percentage points count as unchanged.
pub const TREND_EPSILON: f64 = 0.1;
const PERFECT_TOLERANCE: f64 = 1e-6;
pub const TREND_META_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Silver,
    Gold,
    Diamond,
    // 100% two weeks running
    Goat,
}

impl Trend {
    pub const ALL: [Trend; 4] = [Trend::Silver, Trend::Gold, Trend::Diamond, Trend::Goat];

    pub fn points(self) -> u32 {
        match self {
            Trend::Silver => 0,
            Trend::Gold => 1,
            Trend::Diamond => 2,
            Trend::Goat => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Silver => "silver",
            Trend::Gold => "gold",
            Trend::Diamond => "diamond",
            Trend::Goat => "goat",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the move from `prev` to `curr`. `None` when either side is
/// missing or not finite.
pub fn classify(curr: Option<f64>, prev: Option<f64>) -> Option<Trend> {
    let curr = curr.filter(|v| v.is_finite())?;
    let prev = prev.filter(|v| v.is_finite())?;

    let perfect = |v: f64| (v - 100.0).abs() <= PERFECT_TOLERANCE;
    Some(if perfect(curr) && perfect(prev) {
        Trend::Goat
    } else if curr - prev > TREND_EPSILON {
        Trend::Diamond
    } else if prev - curr > TREND_EPSILON {
        Trend::Silver
    } else {
        Trend::Gold
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComparedWeeks {
    pub from: u8,
    pub to: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendOutcome {
    pub latest_snapshot_id: Option<String>,
    pub compared_weeks: Option<ComparedWeeks>,
    pub labelled: usize,
    pub unlabelled: usize,
}

/// Compares against the closest earlier uploaded week, so gaps in the
/// upload cadence compare across the gap.
pub async fn recompute_latest_trend(
    snapshots: &SnapshotStore,
    term: TermKey,
) -> Result<TrendOutcome, StoreError> {
    let term_snapshots = snapshots.list_term(term).await?;
    let latest = term_snapshots.len().checked_sub(1);
    label_position(snapshots, term, &term_snapshots, latest).await
}

pub async fn recompute_week_trend(
    snapshots: &SnapshotStore,
    term: TermKey,
    week: u8,
) -> Result<TrendOutcome, StoreError> {
    let term_snapshots = snapshots.list_term(term).await?;
    let position = term_snapshots.iter().position(|r| r.snapshot.week == week);
    label_position(snapshots, term, &term_snapshots, position).await
}

async fn label_position(
    snapshots: &SnapshotStore,
    term: TermKey,
    term_snapshots: &[SnapshotRecord],
    position: Option<usize>,
) -> Result<TrendOutcome, StoreError> {
    let Some(position) = position else {
        return Ok(TrendOutcome {
            latest_snapshot_id: None,
            compared_weeks: None,
            labelled: 0,
            unlabelled: 0,
        });
    };
    let target = &term_snapshots[position];
    let prev = position.checked_sub(1).map(|idx| &term_snapshots[idx]);

    let prev_values: HashMap<String, f64> = match prev {
        Some(record) => snapshots
            .rows(&record.id)
            .await?
            .into_iter()
            .filter(|row| row.pct_present.is_finite())
            .map(|row| (row.external_id, row.pct_present))
            .collect(),
        None => HashMap::new(),
    };
    let prev_week = prev.map(|record| record.snapshot.week);
    let week = target.snapshot.week;

    let mut updates = Vec::new();
    for row in snapshots.rows(&target.id).await? {
        let curr = Some(row.pct_present);
        let before = prev_values.get(&row.external_id).copied();
        let trend = classify(curr, before);
        let meta = match (trend, prev_week, before) {
            (Some(_), Some(prev_week), Some(before)) => Some(TrendMeta {
                prev_week,
                week,
                prev: before,
                curr: row.pct_present,
                epsilon: TREND_EPSILON,
                version: TREND_META_VERSION.to_string(),
            }),
            _ => None,
        };
        updates.push(RowTrend {
            external_id: row.external_id,
            trend,
            meta,
        });
    }

    let labelled = updates.iter().filter(|u| u.trend.is_some()).count();
    let unlabelled = updates.len() - labelled;
    snapshots.write_trends(&target.id, &updates).await?;

    let compared_weeks = prev_week.map(|from| ComparedWeeks { from, to: week });
    info!(
        year = term.year,
        term = term.term,
        snapshot_id = %target.id,
        from = ?prev_week,
        to = week,
        labelled,
        unlabelled,
        "trend recomputed"
    );

    Ok(TrendOutcome {
        latest_snapshot_id: Some(target.id.clone()),
        compared_weeks,
        labelled,
        unlabelled,
    })
}
