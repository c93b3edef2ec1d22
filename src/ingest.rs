use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, StoreError};
use crate::leaderboard::{Exclusions, Leaderboards};
use crate::models::{TermKey, TermLeaderboard, Upload, UploadStatus, WeekKey};
use crate::normalize::normalize_attendance;
use crate::roster::Roster;
use crate::snapshots::SnapshotStore;
use crate::store::{commit_chunked, encode_value, DocumentStore, Filter, Lease, SchoolPaths, WriteOp};
use crate::trend::{recompute_latest_trend, recompute_week_trend, ComparedWeeks};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub bytes: Option<Vec<u8>>,
    pub year: i64,
    pub term: i64,
    pub week: i64,
    pub uploaded_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    pub upload_id: String,
    pub snapshot_id: String,
    pub row_count: usize,
    pub label: String,
    pub reused_existing: bool,
    #[serde(skip)]
    pub deduplicated: bool,
    #[serde(skip)]
    pub compared_weeks: Option<ComparedWeeks>,
}

/// `sha256(bytes ++ "\n" ++ label)`, hex encoded.
pub fn upload_checksum(bytes: &[u8], label: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(b"\n");
    hasher.update(label.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Ingestor {
    store: Arc<dyn DocumentStore>,
    paths: SchoolPaths,
    snapshots: SnapshotStore,
    roster: Roster,
    leaderboards: Leaderboards,
}

impl Ingestor {
    pub fn new(store: Arc<dyn DocumentStore>, paths: SchoolPaths, exclusions: Exclusions) -> Self {
        Self {
            snapshots: SnapshotStore::new(store.clone(), paths.clone()),
            roster: Roster::new(store.clone(), paths.clone()),
            leaderboards: Leaderboards::new(store.clone(), paths.clone(), exclusions),
            store,
            paths,
        }
    }

    async fn lock_term(&self, term: TermKey) -> Result<Lease, StoreError> {
        let lease = self.store.lock(&self.paths.leaderboard(term).to_string()).await?;
        debug!(term = %term.doc_id(), "term lock held");
        Ok(lease)
    }

    pub async fn ingest(&self, request: UploadRequest) -> Result<UploadOutcome, IngestError> {
        let key = WeekKey::new(request.year, request.term, request.week)?;
        let bytes = request.bytes.as_deref().ok_or(IngestError::MissingFile)?;
        let label = key.label();
        let checksum = upload_checksum(bytes, &label);

        let _lease = self.lock_term(key.term_key()).await?;
        info!(
            filename = %request.filename,
            label = %label,
            bytes = bytes.len(),
            "upload accepted"
        );

        if let Some(prior) = self.processed_upload(key, &checksum).await? {
            info!(
                upload_id = %prior.upload_id,
                label = %label,
                "duplicate upload; returning prior result"
            );
            return Ok(prior);
        }

        let upload_id = Uuid::new_v4().to_string();
        let path = self.paths.upload(&upload_id);
        let record = Upload {
            filename: request.filename.clone(),
            checksum: checksum.clone(),
            uploaded_by: request.uploaded_by.clone(),
            row_count: 0,
            status: UploadStatus::Processing,
            snapshot_id: None,
            year: key.year,
            term: key.term,
            week: key.week,
            label: label.clone(),
            reused_existing: false,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        let data = encode_value(&path, &record)?;
        commit_chunked(self.store.as_ref(), vec![WriteOp::Set { path, data }]).await?;

        match self.process(key, &upload_id, bytes).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(upload_id = %upload_id, label = %label, error = %err, "upload failed");
                self.mark_failed(&checksum, &err).await;
                Err(err)
            }
        }
    }

    async fn process(
        &self,
        key: WeekKey,
        upload_id: &str,
        bytes: &[u8],
    ) -> Result<UploadOutcome, IngestError> {
        let term = key.term_key();
        let normalized = normalize_attendance(bytes)?;
        let dropped = normalized.dropped();
        if dropped > 0 {
            warn!(dropped, input_rows = normalized.input_rows, "rows dropped during normalization");
        }

        let summary = self
            .snapshots
            .ingest(key, Some(upload_id), normalized.rows)
            .await?;
        info!(
            snapshot_id = %summary.snapshot_id,
            rows = summary.rows_written,
            dropped,
            reused_existing = summary.reused_existing,
            "rows written"
        );

        let latest = recompute_latest_trend(&self.snapshots, term).await?;
        debug!(
            labelled = latest.labelled,
            unlabelled = latest.unlabelled,
            "latest week labelled"
        );
        let compared_weeks = if latest.latest_snapshot_id.as_ref() == Some(&summary.snapshot_id) {
            latest.compared_weeks
        } else {
            self.relabel_backfill(term, key.week).await?
        };

        let board = self
            .leaderboards
            .recompute(&self.snapshots, &self.roster, term)
            .await?;
        debug!(classes = board.leaderboard.len(), "leaderboard stored");

        let latest_id = latest.latest_snapshot_id.as_deref().ok_or_else(|| {
            anyhow!(
                "snapshot {} missing from {} after write",
                summary.snapshot_id,
                term.doc_id()
            )
        })?;
        self.snapshots.mark_latest(latest_id).await?;
        info!(snapshot_id = %latest_id, "latest pointer settled");

        commit_chunked(
            self.store.as_ref(),
            vec![WriteOp::Merge {
                path: self.paths.upload(upload_id),
                data: json!({
                    "status": UploadStatus::Processed,
                    "snapshotId": summary.snapshot_id,
                    "rowCount": summary.rows_written,
                    "reusedExisting": summary.reused_existing,
                    "finishedAt": Utc::now(),
                }),
            }],
        )
        .await?;

        Ok(UploadOutcome {
            upload_id: upload_id.to_string(),
            snapshot_id: summary.snapshot_id,
            row_count: summary.rows_written,
            label: key.label(),
            reused_existing: summary.reused_existing,
            deduplicated: false,
            compared_weeks,
        })
    }

    /// An older week changed: relabel it and the stored week right after it,
    /// unless that one is the latest and was already relabelled.
    async fn relabel_backfill(
        &self,
        term: TermKey,
        week: u8,
    ) -> Result<Option<ComparedWeeks>, IngestError> {
        let own = recompute_week_trend(&self.snapshots, term, week).await?;
        let weeks: Vec<u8> = self
            .snapshots
            .list_term(term)
            .await?
            .iter()
            .map(|record| record.snapshot.week)
            .collect();
        let next = weeks.iter().copied().find(|w| *w > week);
        let last = weeks.last().copied();
        if let Some(next) = next.filter(|next| Some(*next) != last) {
            recompute_week_trend(&self.snapshots, term, next).await?;
        }
        Ok(own.compared_weeks)
    }

    /// A processed upload of the same file only counts while the week's
    /// snapshot still holds its rows.
    async fn processed_upload(
        &self,
        key: WeekKey,
        checksum: &str,
    ) -> Result<Option<UploadOutcome>, IngestError> {
        let Some(current) = self.snapshots.find(key).await? else {
            return Ok(None);
        };
        let collection = self.paths.uploads();
        let filter = Filter::all()
            .eq("checksum", checksum)
            .eq("status", json!(UploadStatus::Processed));
        for doc in self.store.scan(&collection, &filter).await? {
            if current.snapshot.upload_id.as_deref() != Some(doc.id.as_str()) {
                continue;
            }
            let upload: Upload = doc.decode(&collection)?;
            let Some(snapshot_id) = upload.snapshot_id else {
                continue;
            };
            return Ok(Some(UploadOutcome {
                upload_id: doc.id,
                snapshot_id,
                row_count: upload.row_count,
                label: upload.label,
                reused_existing: upload.reused_existing,
                deduplicated: true,
                compared_weeks: None,
            }));
        }
        Ok(None)
    }

    async fn mark_failed(&self, checksum: &str, cause: &IngestError) {
        let collection = self.paths.uploads();
        let filter = Filter::all()
            .eq("checksum", checksum)
            .eq("status", json!(UploadStatus::Processing));
        let result: Result<usize, StoreError> = async {
            let pending = self.store.scan(&collection, &filter).await?;
            let ops = pending
                .into_iter()
                .map(|doc| WriteOp::Merge {
                    path: self.paths.upload(&doc.id),
                    data: json!({
                        "status": UploadStatus::Failed,
                        "error": cause.to_string(),
                        "finishedAt": Utc::now(),
                    }),
                })
                .collect();
            commit_chunked(self.store.as_ref(), ops).await
        }
        .await;
        if let Err(err) = result {
            error!(error = %err, "could not mark upload as failed");
        }
    }

    pub async fn recompute_term(&self, term: TermKey) -> Result<TermLeaderboard, IngestError> {
        let _lease = self.lock_term(term).await?;
        let latest = recompute_latest_trend(&self.snapshots, term).await?;
        let board = self
            .leaderboards
            .recompute(&self.snapshots, &self.roster, term)
            .await?;
        if let Some(latest_id) = &latest.latest_snapshot_id {
            self.snapshots.mark_latest(latest_id).await?;
        }
        Ok(board)
    }
}
