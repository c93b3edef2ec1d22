use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::trend::Trend;

/// A term never runs past twelve instructional weeks.
pub const MAX_TERM_WEEKS: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TermKey {
    pub year: u16,
    pub term: u8,
}

impl TermKey {
    pub fn new(year: i64, term: i64) -> Result<Self, IngestError> {
        Ok(Self {
            year: bounded("year", year, 2000, 2100)? as u16,
            term: bounded("term", term, 1, 4)? as u8,
        })
    }

    pub fn doc_id(&self) -> String {
        format!("{}-T{}", self.year, self.term)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeekKey {
    pub year: u16,
    pub term: u8,
    pub week: u8,
}

impl WeekKey {
    pub fn new(year: i64, term: i64, week: i64) -> Result<Self, IngestError> {
        let term_key = TermKey::new(year, term)?;
        Ok(Self {
            year: term_key.year,
            term: term_key.term,
            week: bounded("week", week, 1, i64::from(MAX_TERM_WEEKS))? as u8,
        })
    }

    pub fn term_key(&self) -> TermKey {
        TermKey {
            year: self.year,
            term: self.term,
        }
    }

    pub fn label(&self) -> String {
        format!("{} T{} W{}", self.year, self.term, self.week)
    }
}

fn bounded(field: &'static str, value: i64, min: i64, max: i64) -> Result<i64, IngestError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(IngestError::InvalidField {
            field,
            value,
            min,
            max,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub year: u16,
    pub term: u8,
    pub week: u8,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_latest: bool,
    #[serde(default)]
    pub class_list: Vec<String>,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub row_count: usize,
}

impl Snapshot {
    pub fn key(&self) -> WeekKey {
        WeekKey {
            year: self.year,
            term: self.term,
            week: self.week,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRow {
    pub external_id: String,
    pub roll_class: String,
    pub pct_present: f64,
    #[serde(default)]
    pub trend: Option<Trend>,
    #[serde(default)]
    pub trend_meta: Option<TrendMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendMeta {
    pub prev_week: u8,
    pub week: u8,
    pub prev: f64,
    pub curr: f64,
    pub epsilon: f64,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Processing,
    Processed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub filename: String,
    pub checksum: String,
    pub uploaded_by: String,
    pub row_count: usize,
    pub status: UploadStatus,
    pub snapshot_id: Option<String>,
    pub year: u16,
    pub term: u8,
    pub week: u8,
    pub label: String,
    pub reused_existing: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub silver: u32,
    pub gold: u32,
    pub diamond: u32,
    pub goat: u32,
}

impl TierCounts {
    pub fn record(&mut self, trend: Trend) {
        match trend {
            Trend::Silver => self.silver += 1,
            Trend::Gold => self.gold += 1,
            Trend::Diamond => self.diamond += 1,
            Trend::Goat => self.goat += 1,
        }
    }

    pub fn absorb(&mut self, other: &TierCounts) {
        self.silver += other.silver;
        self.gold += other.gold;
        self.diamond += other.diamond;
        self.goat += other.goat;
    }

    pub fn get(&self, trend: Trend) -> u32 {
        match trend {
            Trend::Silver => self.silver,
            Trend::Gold => self.gold,
            Trend::Diamond => self.diamond,
            Trend::Goat => self.goat,
        }
    }

    pub fn points(&self) -> u32 {
        Trend::ALL
            .iter()
            .map(|tier| self.get(*tier) * tier.points())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekBreakdown {
    pub week: u8,
    pub counts: TierCounts,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStanding {
    pub roll_id: String,
    pub counts: TierCounts,
    pub raw_points: u32,
    pub norm_points: f64,
    pub student_count: u32,
    pub weeks: Vec<WeekBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermLeaderboard {
    pub year: u16,
    pub term: u8,
    pub weeks: Vec<u8>,
    pub leaderboard: Vec<ClassStanding>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub external_id: String,
    pub roll_class: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn week_key_validates_ranges() {
        assert!(WeekKey::new(2025, 1, 1).is_ok());
        assert!(WeekKey::new(2100, 4, 12).is_ok());

        match WeekKey::new(1999, 1, 1) {
            Err(IngestError::InvalidField { field, .. }) => assert_eq!(field, "year"),
            other => panic!("unexpected {other:?}"),
        }
        match WeekKey::new(2025, 5, 1) {
            Err(IngestError::InvalidField { field, .. }) => assert_eq!(field, "term"),
            other => panic!("unexpected {other:?}"),
        }
        match WeekKey::new(2025, 1, 13) {
            Err(IngestError::InvalidField { field, .. }) => assert_eq!(field, "week"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn labels_and_doc_ids() {
        let key = WeekKey::new(2025, 2, 7).unwrap();
        assert_eq!(key.label(), "2025 T2 W7");
        assert_eq!(key.term_key().doc_id(), "2025-T2");
    }

    #[test]
    fn tier_points_follow_fixed_table() {
        let mut counts = TierCounts::default();
        counts.record(Trend::Silver);
        counts.record(Trend::Gold);
        counts.record(Trend::Diamond);
        counts.record(Trend::Goat);
        counts.record(Trend::Goat);
        assert_eq!(counts.points(), 1 + 2 + 3 + 3);
    }

    #[test]
    fn rows_serialize_with_camel_case_and_null_trend() {
        let row = AttendanceRow {
            external_id: "S1".to_string(),
            roll_class: "10A".to_string(),
            pct_present: 92.0,
            trend: None,
            trend_meta: None,
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["externalId"], "S1");
        assert_eq!(value["rollClass"], "10A");
        assert!(value["trend"].is_null());
    }
}
