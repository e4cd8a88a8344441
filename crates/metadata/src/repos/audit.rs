//! Audit log repository.

use crate::audit::{ChainWalk, GENESIS_HASH, VERIFY_PAGE_SIZE, find_chain_break};
use crate::error::{MetadataError, MetadataResult};
use crate::models::AuditEntry;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for the append-only audit log.
#[async_trait]
pub trait AuditRepo: Send + Sync {
    /// Append an entry.
    ///
    /// With hash chaining enabled, an entry without a precomputed hash is
    /// linked to the last persisted row inside the inserting transaction.
    /// Returns the entry as stored.
    async fn log(&self, entry: AuditEntry) -> MetadataResult<AuditEntry>;

    /// Hash of the newest entry, or an empty string for an empty log.
    async fn last_hash(&self) -> MetadataResult<String>;

    /// Delete entries older than `before`.
    ///
    /// The storage engine rejects deletes from the audit log, so this fails
    /// with [`MetadataError::AppendOnly`](crate::MetadataError::AppendOnly)
    /// and removes nothing unless that protection was lifted out of band.
    async fn purge(&self, before: OffsetDateTime) -> MetadataResult<u64>;

    /// Entries with ids in `from_id..=to_id`, ascending.
    async fn list_entries(&self, from_id: i64, to_id: i64) -> MetadataResult<Vec<AuditEntry>>;

    /// At most `limit` entries with ids in `from_id..=to_id`, ascending.
    async fn list_page(
        &self,
        from_id: i64,
        to_id: i64,
        limit: i64,
    ) -> MetadataResult<Vec<AuditEntry>>;

    /// `entry_hash` of the newest entry with an id below `id`.
    async fn hash_before(&self, id: i64) -> MetadataResult<Option<String>>;

    /// Walk `from_id..=to_id` in id-ordered pages and stop at the first
    /// entry that does not follow from its predecessor.
    async fn walk_chain(&self, from_id: i64, to_id: i64) -> MetadataResult<ChainWalk> {
        if from_id > to_id {
            return Err(MetadataError::InvalidInput(format!(
                "audit range {from_id}..={to_id} is empty"
            )));
        }

        let mut anchor = self
            .hash_before(from_id)
            .await?
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let mut walk = ChainWalk::default();
        let mut next_id = from_id;
        loop {
            let page = self.list_page(next_id, to_id, VERIFY_PAGE_SIZE).await?;
            let Some(last) = page.last() else {
                break;
            };

            if let Some(chain_break) = find_chain_break(&page, &anchor) {
                walk.entries += page.iter().filter(|e| e.id <= chain_break.entry_id).count();
                walk.last_id = Some(chain_break.entry_id);
                walk.first_break = Some(chain_break);
                return Ok(walk);
            }

            walk.entries += page.len();
            walk.last_id = Some(last.id);
            if last.id >= to_id || page.len() < VERIFY_PAGE_SIZE as usize {
                break;
            }
            anchor = last.entry_hash.clone();
            next_id = last.id + 1;
        }
        Ok(walk)
    }

    /// Verify linkage and digests for ids in `from_id..=to_id`.
    ///
    /// A broken chain is `Ok(false)`; `Err` means the entries could not be read.
    async fn verify_chain(&self, from_id: i64, to_id: i64) -> MetadataResult<bool> {
        let walk = self.walk_chain(from_id, to_id).await?;
        match walk.first_break {
            None => Ok(true),
            Some(chain_break) => {
                tracing::warn!(
                    entry_id = chain_break.entry_id,
                    reason = ?chain_break.reason,
                    "Audit chain broken"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{BreakReason, ChainBreak, seal};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trove_core::{DbRole, OperationContext};

    /// Sealed entries held in memory, counting page reads.
    struct MemoryAudit {
        entries: Vec<AuditEntry>,
        pages: AtomicUsize,
    }

    impl MemoryAudit {
        fn sealed(len: i64) -> Self {
            let op = OperationContext::new(DbRole::Scrape, "memory");
            let mut entries: Vec<AuditEntry> = Vec::new();
            for id in 1..=len {
                let mut entry = AuditEntry::new("node", &op, "insert", "datasets");
                entry.id = id;
                let prev = entries.last().map(|e| e.entry_hash.clone()).unwrap_or_default();
                seal(&mut entry, &prev);
                entries.push(entry);
            }
            Self {
                entries,
                pages: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AuditRepo for MemoryAudit {
        async fn log(&self, entry: AuditEntry) -> MetadataResult<AuditEntry> {
            Ok(entry)
        }

        async fn last_hash(&self) -> MetadataResult<String> {
            Ok(self.entries.last().map(|e| e.entry_hash.clone()).unwrap_or_default())
        }

        async fn purge(&self, _before: OffsetDateTime) -> MetadataResult<u64> {
            Err(MetadataError::AppendOnly("audit_log".to_string()))
        }

        async fn list_entries(&self, from_id: i64, to_id: i64) -> MetadataResult<Vec<AuditEntry>> {
            self.list_page(from_id, to_id, i64::MAX).await
        }

        async fn list_page(
            &self,
            from_id: i64,
            to_id: i64,
            limit: i64,
        ) -> MetadataResult<Vec<AuditEntry>> {
            self.pages.fetch_add(1, Ordering::Relaxed);
            Ok(self
                .entries
                .iter()
                .filter(|e| (from_id..=to_id).contains(&e.id))
                .take(usize::try_from(limit).unwrap_or(usize::MAX))
                .cloned()
                .collect())
        }

        async fn hash_before(&self, id: i64) -> MetadataResult<Option<String>> {
            Ok(self
                .entries
                .iter()
                .rev()
                .find(|e| e.id < id)
                .map(|e| e.entry_hash.clone()))
        }
    }

    #[tokio::test]
    async fn test_walk_spans_pages() {
        let repo = MemoryAudit::sealed(VERIFY_PAGE_SIZE * 2 + 7);

        let walk = repo.walk_chain(1, i64::MAX).await.unwrap();

        assert!(walk.is_intact());
        assert_eq!(walk.entries, (VERIFY_PAGE_SIZE * 2 + 7) as usize);
        assert_eq!(walk.last_id, Some(VERIFY_PAGE_SIZE * 2 + 7));
        assert_eq!(repo.pages.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_walk_anchors_each_page_on_previous() {
        let mut repo = MemoryAudit::sealed(VERIFY_PAGE_SIZE + 3);
        // First entry of the second page no longer follows the first page.
        let idx = VERIFY_PAGE_SIZE as usize;
        let mut relinked = repo.entries[idx].clone();
        seal(&mut relinked, "elsewhere");
        repo.entries[idx] = relinked;

        let walk = repo.walk_chain(1, i64::MAX).await.unwrap();

        assert_eq!(
            walk.first_break,
            Some(ChainBreak {
                entry_id: VERIFY_PAGE_SIZE + 1,
                reason: BreakReason::Linkage,
            })
        );
        assert_eq!(walk.entries, VERIFY_PAGE_SIZE as usize + 1);
        assert!(!repo.verify_chain(1, i64::MAX).await.unwrap());
    }

    #[tokio::test]
    async fn test_walk_starts_from_preceding_hash() {
        let repo = MemoryAudit::sealed(10);

        let walk = repo.walk_chain(4, 6).await.unwrap();

        assert!(walk.is_intact());
        assert_eq!(walk.entries, 3);
        assert_eq!(walk.last_id, Some(6));
        assert!(repo.verify_chain(4, 6).await.unwrap());
    }

    #[tokio::test]
    async fn test_walk_empty_and_inverted_ranges() {
        let repo = MemoryAudit::sealed(0);
        let walk = repo.walk_chain(1, i64::MAX).await.unwrap();
        assert_eq!(walk, ChainWalk::default());

        let err = repo.walk_chain(9, 3).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidInput(_)));
    }
}
