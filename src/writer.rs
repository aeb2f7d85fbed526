//! Metadata writer
//!
//! Replaces a destination collection with a freshly materialized document
//! set, in fixed-size unordered batches. Nothing already written is rolled
//! back when a batch fails. Both passes write through here: filter metadata
//! and the per-category facet cache.

use crate::config::ReplaceStrategy;
use crate::memory_guard::MemoryGuard;
use crate::precompute::PrecomputeError;
use crate::store::{CollectionTarget, DocumentSink};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Documents removed by the clear step
    pub cleared: u64,
    pub inserted: u64,
    /// Documents rejected individually inside otherwise successful batches
    pub failed: u64,
    pub batches: u64,
}

pub struct MetadataWriter {
    batch_size: usize,
    strategy: ReplaceStrategy,
}

impl MetadataWriter {
    pub fn new(batch_size: usize, strategy: ReplaceStrategy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            strategy,
        }
    }

    pub async fn replace_all<S, D>(
        &self,
        store: &mut S,
        docs: &[D],
        guard: &mut MemoryGuard,
    ) -> Result<WriteReport, PrecomputeError>
    where
        S: DocumentSink<D>,
        D: Sync,
    {
        match self.strategy {
            ReplaceStrategy::InPlace => self.write_into(store, CollectionTarget::Live, docs, guard).await,
            // Nothing to stage; renaming an empty staging collection is not
            // portable, so clearing the live one gives the same end state.
            ReplaceStrategy::StagedSwap if docs.is_empty() => {
                self.write_into(store, CollectionTarget::Live, docs, guard).await
            }
            ReplaceStrategy::StagedSwap => {
                let report = self.write_into(store, CollectionTarget::Staging, docs, guard).await?;
                store.promote_staging().await.map_err(PrecomputeError::Promote)?;
                log::info!("🔁 Promoted staging collection to live");
                Ok(report)
            }
        }
    }

    async fn write_into<S, D>(
        &self,
        store: &mut S,
        target: CollectionTarget,
        docs: &[D],
        guard: &mut MemoryGuard,
    ) -> Result<WriteReport, PrecomputeError>
    where
        S: DocumentSink<D>,
        D: Sync,
    {
        let mut report = WriteReport::default();

        report.cleared = store
            .clear(target)
            .await
            .map_err(|source| PrecomputeError::Clear { target, source })?;
        log::info!(
            "🧹 Cleared {} existing documents from {} collection",
            report.cleared,
            target.as_str()
        );

        for batch in docs.chunks(self.batch_size) {
            let outcome = store.insert_batch(target, batch).await.map_err(|source| {
                PrecomputeError::Write {
                    target,
                    inserted: report.inserted,
                    source,
                }
            })?;

            report.inserted += outcome.inserted;
            report.failed += outcome.failed;
            report.batches += 1;

            if outcome.failed > 0 {
                log::warn!(
                    "⚠️  Batch {}: {} documents rejected, {} inserted",
                    report.batches,
                    outcome.failed,
                    outcome.inserted
                );
            }
            log::info!("📝 Inserted {} documents...", report.inserted);
            guard.sample();
        }

        Ok(report)
    }
}
