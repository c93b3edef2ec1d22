use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AttendanceRow, Snapshot, TermKey, TrendMeta, WeekKey};
use crate::normalize::{storage_key, NormalizedRow};
use crate::store::{
    commit_chunked, decode_value, encode_value, DocPath, DocumentStore, Filter, SchoolPaths,
    WriteOp,
};
use crate::trend::Trend;

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub id: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub snapshot_id: String,
    pub rows_written: usize,
    pub reused_existing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowTrend {
    pub external_id: String,
    pub trend: Option<Trend>,
    pub meta: Option<TrendMeta>,
}

#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn DocumentStore>,
    paths: SchoolPaths,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn DocumentStore>, paths: SchoolPaths) -> Self {
        Self { store, paths }
    }

    pub async fn get(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        let path = self.paths.snapshot(snapshot_id);
        match self.store.get(&path).await? {
            Some(data) => Ok(Some(SnapshotRecord {
                id: snapshot_id.to_string(),
                snapshot: decode_value(&path, data)?,
            })),
            None => Ok(None),
        }
    }

    pub async fn find(&self, key: WeekKey) -> Result<Option<SnapshotRecord>, StoreError> {
        let filter = Filter::all()
            .eq("year", key.year)
            .eq("term", key.term)
            .eq("week", key.week);
        let mut matches = self.scan(&filter).await?;
        if matches.len() > 1 {
            warn!(
                year = key.year,
                term = key.term,
                week = key.week,
                count = matches.len(),
                "multiple snapshots share one week; using the first"
            );
        }
        Ok(if matches.is_empty() {
            None
        } else {
            Some(matches.swap_remove(0))
        })
    }

    pub async fn list_term(&self, term: TermKey) -> Result<Vec<SnapshotRecord>, StoreError> {
        let filter = Filter::all().eq("year", term.year).eq("term", term.term);
        let mut records = self.scan(&filter).await?;
        records.sort_by_key(|r| r.snapshot.week);
        Ok(records)
    }

    pub async fn list_all(&self) -> Result<Vec<SnapshotRecord>, StoreError> {
        let mut records = self.scan(&Filter::all()).await?;
        records.sort_by_key(|r| r.snapshot.key());
        Ok(records)
    }

    async fn scan(&self, filter: &Filter) -> Result<Vec<SnapshotRecord>, StoreError> {
        let collection = self.paths.snapshots();
        self.store
            .scan(&collection, filter)
            .await?
            .into_iter()
            .map(|doc| {
                Ok(SnapshotRecord {
                    snapshot: doc.decode(&collection)?,
                    id: doc.id,
                })
            })
            .collect()
    }

    pub async fn rows(&self, snapshot_id: &str) -> Result<Vec<AttendanceRow>, StoreError> {
        self.scan_rows(snapshot_id, &Filter::all()).await
    }

    pub async fn rows_for_class(
        &self,
        snapshot_id: &str,
        roll_class: &str,
    ) -> Result<Vec<AttendanceRow>, StoreError> {
        self.scan_rows(snapshot_id, &Filter::all().eq("rollClass", roll_class))
            .await
    }

    pub async fn row(
        &self,
        snapshot_id: &str,
        external_id: &str,
    ) -> Result<Option<AttendanceRow>, StoreError> {
        let path = self.paths.row(snapshot_id, external_id);
        self.store
            .get(&path)
            .await?
            .map(|data| decode_value(&path, data))
            .transpose()
    }

    async fn scan_rows(
        &self,
        snapshot_id: &str,
        filter: &Filter,
    ) -> Result<Vec<AttendanceRow>, StoreError> {
        let collection = self.paths.rows(snapshot_id);
        self.store
            .scan(&collection, filter)
            .await?
            .iter()
            .map(|doc| doc.decode(&collection))
            .collect()
    }

    /// Rows sharing a storage key collapse to the last one in the file.
    pub async fn ingest(
        &self,
        key: WeekKey,
        upload_id: Option<&str>,
        rows: Vec<NormalizedRow>,
    ) -> Result<IngestSummary, StoreError> {
        let now = Utc::now();
        let existing = self.find(key).await?;
        let reused_existing = existing.is_some();
        let snapshot_id = match existing {
            Some(record) => {
                let stale = self
                    .store
                    .scan(&self.paths.rows(&record.id), &Filter::all())
                    .await?;
                let deletes: Vec<WriteOp> = stale
                    .into_iter()
                    .map(|doc| WriteOp::Delete {
                        path: DocPath::new(self.paths.rows(&record.id), doc.id),
                    })
                    .collect();
                let removed = deletes.len();
                commit_chunked(self.store.as_ref(), deletes).await?;
                self.store_merge(
                    &record.id,
                    json!({ "updatedAt": now, "uploadId": upload_id }),
                )
                .await?;
                info!(snapshot_id = %record.id, removed, label = %key.label(), "overwriting snapshot");
                record.id
            }
            None => {
                let snapshot_id = Uuid::new_v4().to_string();
                let path = self.paths.snapshot(&snapshot_id);
                let snapshot = Snapshot {
                    year: key.year,
                    term: key.term,
                    week: key.week,
                    label: key.label(),
                    created_at: now,
                    updated_at: now,
                    is_latest: false,
                    class_list: Vec::new(),
                    upload_id: upload_id.map(str::to_string),
                    row_count: 0,
                };
                let data = encode_value(&path, &snapshot)?;
                commit_chunked(self.store.as_ref(), vec![WriteOp::Set { path, data }]).await?;
                info!(snapshot_id = %snapshot_id, label = %key.label(), "created snapshot");
                snapshot_id
            }
        };

        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut unique: Vec<AttendanceRow> = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = AttendanceRow {
                external_id: row.external_id,
                roll_class: row.roll_class,
                pct_present: row.pct_present,
                trend: None,
                trend_meta: None,
            };
            let row_key = storage_key(&stored.external_id);
            match positions.get(&row_key) {
                Some(&idx) => unique[idx] = stored,
                None => {
                    positions.insert(row_key, unique.len());
                    unique.push(stored);
                }
            }
        }

        let class_list: Vec<String> = unique
            .iter()
            .map(|row| row.roll_class.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut writes = Vec::with_capacity(unique.len());
        for row in &unique {
            let path = self.paths.row(&snapshot_id, &row.external_id);
            let data = encode_value(&path, row)?;
            writes.push(WriteOp::Set { path, data });
        }
        let batches = commit_chunked(self.store.as_ref(), writes).await?;
        debug!(snapshot_id = %snapshot_id, rows = unique.len(), batches, "rows written");

        self.store_merge(
            &snapshot_id,
            json!({
                "classList": class_list,
                "rowCount": unique.len(),
                "updatedAt": Utc::now(),
            }),
        )
        .await?;
        self.mark_latest(&snapshot_id).await?;

        Ok(IngestSummary {
            snapshot_id,
            rows_written: unique.len(),
            reused_existing,
        })
    }

    pub async fn write_trends(
        &self,
        snapshot_id: &str,
        trends: &[RowTrend],
    ) -> Result<usize, StoreError> {
        let ops: Vec<WriteOp> = trends
            .iter()
            .map(|t| WriteOp::Merge {
                path: self.paths.row(snapshot_id, &t.external_id),
                data: json!({ "trend": t.trend, "trendMeta": t.meta }),
            })
            .collect();
        commit_chunked(self.store.as_ref(), ops).await
    }

    /// Point the school at `snapshot_id` and clear every other latest flag.
    pub async fn mark_latest(&self, snapshot_id: &str) -> Result<(), StoreError> {
        let flagged = self.scan(&Filter::all().eq("isLatest", true)).await?;
        let mut ops: Vec<WriteOp> = flagged
            .iter()
            .filter(|record| record.id != snapshot_id)
            .map(|record| WriteOp::Merge {
                path: self.paths.snapshot(&record.id),
                data: json!({ "isLatest": false }),
            })
            .collect();
        ops.push(WriteOp::Merge {
            path: self.paths.snapshot(snapshot_id),
            data: json!({ "isLatest": true }),
        });
        ops.push(WriteOp::Merge {
            path: self.paths.school(),
            data: json!({ "latestSnapshotId": snapshot_id, "latestUpdatedAt": Utc::now() }),
        });
        commit_chunked(self.store.as_ref(), ops).await?;
        debug!(snapshot_id, "latest pointer moved");
        Ok(())
    }

    pub async fn latest(&self) -> Result<Option<SnapshotRecord>, StoreError> {
        let school = self.store.get(&self.paths.school()).await?;
        let pointer = school
            .as_ref()
            .and_then(|doc| doc.get("latestSnapshotId"))
            .and_then(|id| id.as_str());
        if let Some(id) = pointer {
            if let Some(record) = self.get(id).await? {
                return Ok(Some(record));
            }
        }
        Ok(self
            .scan(&Filter::all().eq("isLatest", true))
            .await?
            .into_iter()
            .max_by_key(|record| record.snapshot.key()))
    }

    async fn store_merge(&self, snapshot_id: &str, data: serde_json::Value) -> Result<(), StoreError> {
        commit_chunked(
            self.store.as_ref(),
            vec![WriteOp::Merge {
                path: self.paths.snapshot(snapshot_id),
                data,
            }],
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn row(id: &str, roll: &str, pct: f64) -> NormalizedRow {
        NormalizedRow {
            external_id: id.to_string(),
            roll_class: roll.to_string(),
            pct_present: pct,
        }
    }

    fn setup() -> (Arc<MemoryStore>, SnapshotStore) {
        let memory = Arc::new(MemoryStore::new());
        let snapshots = SnapshotStore::new(memory.clone(), SchoolPaths::new("test"));
        (memory, snapshots)
    }

    #[tokio::test]
    async fn overwrite_replaces_all_rows() {
        let (_, snapshots) = setup();
        let key = WeekKey::new(2025, 1, 3).unwrap();

        let first = snapshots
            .ingest(key, None, vec![row("S1", "10A", 90.0), row("S2", "10B", 80.0)])
            .await
            .unwrap();
        assert!(!first.reused_existing);

        let second = snapshots
            .ingest(key, None, vec![row("S3", "11C", 70.0)])
            .await
            .unwrap();
        assert!(second.reused_existing);
        assert_eq!(second.snapshot_id, first.snapshot_id);

        let term = snapshots.list_term(key.term_key()).await.unwrap();
        assert_eq!(term.len(), 1);
        assert_eq!(term[0].snapshot.class_list, vec!["11C"]);
        assert_eq!(term[0].snapshot.row_count, 1);

        let rows = snapshots.rows(&first.snapshot_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_id, "S3");
    }

    #[tokio::test]
    async fn duplicate_ids_keep_the_last_row() {
        let (_, snapshots) = setup();
        let key = WeekKey::new(2025, 1, 1).unwrap();
        let summary = snapshots
            .ingest(
                key,
                None,
                vec![row("S1", "10A", 50.0), row("S2", "10A", 60.0), row("S1", "10A", 55.0)],
            )
            .await
            .unwrap();
        assert_eq!(summary.rows_written, 2);
        let s1 = snapshots.row(&summary.snapshot_id, "S1").await.unwrap().unwrap();
        assert_eq!(s1.pct_present, 55.0);
    }

    #[tokio::test]
    async fn large_uploads_are_split_into_batches() {
        let (memory, snapshots) = setup();
        let rows: Vec<_> = (0..1_100)
            .map(|i| row(&format!("S{i:04}"), "10A", 90.0))
            .collect();
        let before = memory.commits();
        let summary = snapshots
            .ingest(WeekKey::new(2025, 1, 1).unwrap(), None, rows)
            .await
            .unwrap();
        assert_eq!(summary.rows_written, 1_100);
        // create + 3 row batches + class list merge + latest flip
        assert_eq!(memory.commits() - before, 6);
    }

    #[tokio::test]
    async fn exactly_one_snapshot_is_latest() {
        let (_, snapshots) = setup();
        let w1 = snapshots
            .ingest(WeekKey::new(2025, 1, 1).unwrap(), None, vec![row("S1", "10A", 90.0)])
            .await
            .unwrap();
        let w2 = snapshots
            .ingest(WeekKey::new(2025, 1, 2).unwrap(), None, vec![row("S1", "10A", 91.0)])
            .await
            .unwrap();

        snapshots.mark_latest(&w1.snapshot_id).await.unwrap();
        let all = snapshots.list_all().await.unwrap();
        let flagged: Vec<_> = all.iter().filter(|r| r.snapshot.is_latest).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, w1.snapshot_id);

        snapshots.mark_latest(&w2.snapshot_id).await.unwrap();
        let latest = snapshots.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, w2.snapshot_id);
    }
}
