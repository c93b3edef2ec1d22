use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::error::{IngestError, StoreError};
use crate::models::RosterEntry;
use crate::normalize::{self, storage_key, Column};
use crate::store::{
    commit_chunked, decode_value, encode_value, DocPath, DocumentStore, Filter, SchoolPaths,
    WriteOp,
};

/// Parse a roster export. Rows without an id or roll class are skipped, and
/// a repeated id keeps its last row.
pub fn parse_roster(bytes: &[u8]) -> Result<Vec<RosterEntry>, IngestError> {
    let mut reader = normalize::reader(bytes);
    let headers = reader.headers()?.clone();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestError::EmptyInput);
    }
    let columns = normalize::match_columns(
        &headers,
        &[Column::ExternalId, Column::RollClass],
        &[Column::Email],
    )?;

    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut entries: Vec<RosterEntry> = Vec::new();
    let mut seen = 0usize;
    for record in reader.records() {
        let record = record?;
        seen += 1;
        let external_id = columns.field(&record, Column::ExternalId);
        let roll_class = columns.field(&record, Column::RollClass);
        if external_id.is_empty() || roll_class.is_empty() {
            continue;
        }
        let email = Some(columns.field(&record, Column::Email))
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        let entry = RosterEntry {
            external_id: external_id.to_string(),
            roll_class: roll_class.to_string(),
            email,
        };
        match positions.get(&storage_key(external_id)) {
            Some(&idx) => entries[idx] = entry,
            None => {
                positions.insert(storage_key(external_id), entries.len());
                entries.push(entry);
            }
        }
    }

    if seen == 0 {
        return Err(IngestError::EmptyInput);
    }
    Ok(entries)
}

#[derive(Clone)]
pub struct Roster {
    store: Arc<dyn DocumentStore>,
    paths: SchoolPaths,
}

impl Roster {
    pub fn new(store: Arc<dyn DocumentStore>, paths: SchoolPaths) -> Self {
        Self { store, paths }
    }

    pub async fn replace(&self, entries: &[RosterEntry]) -> Result<usize, StoreError> {
        let collection = self.paths.roster();
        let existing = self.store.scan(&collection, &Filter::all()).await?;
        let removed = existing.len();
        let deletes: Vec<WriteOp> = existing
            .into_iter()
            .map(|doc| WriteOp::Delete {
                path: DocPath::new(collection.clone(), doc.id),
            })
            .collect();
        commit_chunked(self.store.as_ref(), deletes).await?;

        let mut writes = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = self.paths.roster_entry(&entry.external_id);
            let data = encode_value(&path, entry)?;
            writes.push(WriteOp::Set { path, data });
        }
        commit_chunked(self.store.as_ref(), writes).await?;
        info!(removed, stored = entries.len(), "roster replaced");
        Ok(entries.len())
    }

    pub async fn entries(&self) -> Result<Vec<RosterEntry>, StoreError> {
        let collection = self.paths.roster();
        self.store
            .scan(&collection, &Filter::all())
            .await?
            .iter()
            .map(|doc| doc.decode(&collection))
            .collect()
    }

    pub async fn class_counts(&self) -> Result<HashMap<String, u32>, StoreError> {
        let mut counts = HashMap::new();
        for entry in self.entries().await? {
            *counts.entry(entry.roll_class).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub async fn lookup(&self, external_id: &str) -> Result<Option<RosterEntry>, StoreError> {
        let path = self.paths.roster_entry(external_id);
        self.store
            .get(&path)
            .await?
            .map(|data| decode_value(&path, data))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn roster_headers_are_tolerant() {
        let csv = "Student Number,Roll Group,Email Address\n\
                   S1,10A,s1@school.test\n\
                   S2,10A,\n\
                   ,10B,x@school.test\n\
                   S1,10B,s1@school.test\n";
        let entries = parse_roster(csv.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].external_id, "S1");
        assert_eq!(entries[0].roll_class, "10B");
        assert_eq!(entries[1].email, None);
    }

    #[test]
    fn roster_without_roll_column_is_rejected() {
        let csv = "Student ID,Name\nS1,Avery\n";
        assert!(matches!(
            parse_roster(csv.as_bytes()),
            Err(IngestError::MissingColumns { .. })
        ));
    }

    #[tokio::test]
    async fn replace_drops_previous_roster() {
        let memory = Arc::new(MemoryStore::new());
        let roster = Roster::new(memory.clone(), SchoolPaths::new("t"));
        let entry = |id: &str, roll: &str| RosterEntry {
            external_id: id.to_string(),
            roll_class: roll.to_string(),
            email: None,
        };

        roster
            .replace(&[entry("S1", "10A"), entry("S2", "10A"), entry("S3", "10B")])
            .await
            .unwrap();
        roster.replace(&[entry("S4", "11C")]).await.unwrap();

        let counts = roster.class_counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.get("11C"), Some(&1));
        assert!(roster.lookup("S1").await.unwrap().is_none());
        assert_eq!(
            roster.lookup("S4").await.unwrap().map(|e| e.roll_class),
            Some("11C".to_string())
        );
    }
}
