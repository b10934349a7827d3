use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ParseError;
use crate::models::{CacheMetadata, Job};
use crate::services::batch::{available_memory_mb, BatchProcessor, BatchSettings};
use crate::services::cache::CacheStore;
use crate::services::job_queue::JobRunner;
use crate::services::m3u_parser::M3uSource;
use crate::services::progress::{ParsePhase, ProgressTracker};
use crate::services::series_grouper::{fuzzy_merge, FuzzyConfig};

/// Average bytes per entry in real IPTV playlists, used only for the
/// progress total estimate
const ESTIMATE_BYTES_PER_ITEM: u64 = 200;

/// Per-job execution of the full parse pipeline:
/// fetch -> stream -> batch -> fuzzy merge -> finalize.
pub struct IngestPipeline {
    source: M3uSource,
    store: CacheStore,
    progress: ProgressTracker,
    tier_sizes: (usize, usize, usize),
    fuzzy: FuzzyConfig,
}

impl IngestPipeline {
    pub fn new(config: &Config, store: CacheStore, progress: ProgressTracker) -> Self {
        let source = M3uSource::new(
            &config.user_agent,
            config.fetch_timeout_ms,
            config.max_retries,
            config.max_playlist_size_mb,
        );
        Self {
            source,
            store,
            progress,
            tier_sizes: (
                config.batch_size_tier_tv,
                config.batch_size_tier_mobile,
                config.batch_size_tier_desktop,
            ),
            fuzzy: FuzzyConfig {
                similarity_threshold: config.fuzzy_similarity_threshold,
                max_comparisons_per_singleton: config.fuzzy_max_comparisons_per_singleton,
                max_singletons: config.fuzzy_max_singletons,
            },
        }
    }

    /// Run one attempt for a job. The queue handles retry; this method
    /// handles progress, artifact cleanup and the submission deadline.
    pub async fn execute(&self, job: &Job) -> Result<(), ParseError> {
        let hash = job.hash.clone();
        self.progress.start(&hash).await;

        let cancel = CancellationToken::new();
        let work = self.run(job, &cancel);

        let result = match job.options.deadline_ms {
            Some(deadline) => {
                match tokio::time::timeout(Duration::from_millis(deadline), work).await {
                    Ok(result) => result,
                    Err(_) => {
                        cancel.cancel();
                        Err(ParseError::Cancelled)
                    }
                }
            }
            None => work.await,
        };

        match result {
            Ok(meta) => {
                self.progress
                    .complete(
                        &hash,
                        meta.stats.total_items as u64,
                        meta.stats.group_count as u64,
                        meta.series_stats.total_series as u64,
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                self.progress.fail(&hash, &e.to_string()).await;
                // Deadline aborts leave partial artifacts for the next
                // submission to overwrite; real failures discard them
                if !matches!(e, ParseError::Cancelled) {
                    self.store.delete_entry(&hash).await;
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<CacheMetadata, ParseError> {
        let hash = &job.hash;

        self.progress.set_phase(hash, ParsePhase::Downloading).await;
        let m3u = self.source.open(&job.url, job.options.normalize).await?;

        if let Some(len) = m3u.content_length {
            self.progress
                .set_items_total(hash, Some(len / ESTIMATE_BYTES_PER_ITEM))
                .await;
        }

        self.progress.set_phase(hash, ParsePhase::Parsing).await;
        let mut writer = self.store.create_writer(hash, &job.url).await?;

        let settings = BatchSettings::for_tier(job.options.device_tier, self.tier_sizes)
            .adjust_for_memory(available_memory_mb());
        tracing::info!(
            hash = %hash,
            batch_size = settings.batch_size,
            gc_interval = settings.gc_interval,
            "batch settings selected"
        );

        let processor = BatchProcessor::new(settings, job.options.clone());
        let result = match processor
            .process(m3u.entries, &mut writer, &self.progress, cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                writer.abort().await;
                return Err(e);
            }
        };

        self.progress.set_phase(hash, ParsePhase::BuildingGroups).await;
        let mut stats = result.stats;
        stats.group_count = result.groups.len();

        self.progress.set_phase(hash, ParsePhase::BuildingSeries).await;
        let mut series_accum = result.series;
        let merge = fuzzy_merge(&mut series_accum, &self.fuzzy);
        if merge.merged > 0 {
            tracing::info!(hash = %hash, merged = merge.merged, "singleton series merged");
        }

        let series_stats = series_accum.stats();
        let series = series_accum.into_series();

        let meta = writer
            .finalize(stats, result.groups, series, series_stats, &merge.remaps)
            .await?;

        tracing::info!(
            hash = %hash,
            items = meta.stats.total_items,
            groups = meta.stats.group_count,
            series = meta.series_stats.total_series,
            duplicates = result.duplicates_skipped,
            losses = result.losses,
            "parse complete"
        );

        Ok(meta)
    }
}

/// Adapt the pipeline into the queue's runner callback
pub fn make_runner(pipeline: Arc<IngestPipeline>) -> JobRunner {
    Arc::new(move |job: Job| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move { pipeline.execute(&job).await })
    })
}
