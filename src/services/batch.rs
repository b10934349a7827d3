use std::collections::{HashMap, HashSet};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::ParseError;
use crate::models::{DeviceTier, MediaKind, ParseOptions, PlaylistGroup, PlaylistStats};
use crate::services::cache::CacheWriter;
use crate::services::m3u_parser::{hash_url, EntryStream};
use crate::services::progress::{ParsePhase, ProgressTracker};
use crate::services::series_grouper::{RunEpisode, SeriesAccumulator, SeriesRun};

/// Preview threshold: once this many items are persisted (and groups have
/// been flushed once) the UI may navigate partial results
const CAN_NAVIGATE_ITEMS: usize = 500;

/// Batch tuning per device tier, degraded under memory pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub gc_interval: usize,
    pub series_chunk_size: usize,
}

impl BatchSettings {
    pub fn for_tier(tier: DeviceTier, tier_sizes: (usize, usize, usize)) -> Self {
        let (tv, mobile, desktop) = tier_sizes;
        match tier {
            DeviceTier::Tv => Self {
                batch_size: tv,
                gc_interval: 5,
                series_chunk_size: 10_000,
            },
            DeviceTier::Mobile => Self {
                batch_size: mobile,
                gc_interval: 8,
                series_chunk_size: 20_000,
            },
            DeviceTier::Desktop => Self {
                batch_size: desktop,
                gc_interval: 10,
                series_chunk_size: 50_000,
            },
        }
    }

    /// Halve under 200 MB free, clamp hard under 100 MB
    pub fn adjust_for_memory(self, available_mb: Option<u64>) -> Self {
        match available_mb {
            Some(mb) if mb < 100 => Self {
                batch_size: 100,
                gc_interval: 3,
                series_chunk_size: 1_000,
            },
            Some(mb) if mb < 200 => Self {
                batch_size: (self.batch_size / 2).max(1),
                gc_interval: (self.gc_interval / 2).max(1),
                series_chunk_size: self.series_chunk_size,
            },
            _ => self,
        }
    }
}

/// Free system memory in MB, when the platform exposes it
pub fn available_memory_mb() -> Option<u64> {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let available = sys.available_memory();
    if available == 0 {
        None
    } else {
        Some(available / (1024 * 1024))
    }
}

/// FNV-1a 32-bit; enough for in-playlist URL dedupe
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Structural URL filter: http(s) only, no obviously non-stream payloads
fn acceptable_url(raw: &str) -> bool {
    let parsed = match url::Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return false,
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    let path = parsed.path().to_lowercase();
    const BANNED_EXT: [&str; 9] = [
        ".zip", ".rar", ".7z", ".exe", ".apk", ".jpg", ".jpeg", ".png", ".gif",
    ];
    !BANNED_EXT.iter().any(|ext| path.ends_with(ext))
}

/// Outcome of one streamed batch run
#[derive(Debug)]
pub struct BatchResult {
    pub stats: PlaylistStats,
    pub groups: Vec<PlaylistGroup>,
    pub series: SeriesAccumulator,
    pub duplicates_skipped: usize,
    pub filtered_out: usize,
    pub losses: usize,
}

/// Pulls parsed entries, maintains aggregates and series runs, and flushes
/// adaptive batches to the cache writer. Single-threaded per job;
/// back-pressure comes from awaiting each flush before pulling more.
pub struct BatchProcessor {
    settings: BatchSettings,
    options: ParseOptions,
}

impl BatchProcessor {
    pub fn new(settings: BatchSettings, options: ParseOptions) -> Self {
        Self { settings, options }
    }

    pub async fn process(
        &self,
        mut entries: EntryStream,
        writer: &mut CacheWriter,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, ParseError> {
        let hash = writer.hash().to_string();

        let mut stats = PlaylistStats::default();
        let mut groups: HashMap<String, PlaylistGroup> = HashMap::new();
        let mut series = SeriesAccumulator::new(&hash);
        let mut current_run: Option<SeriesRun> = None;

        let mut seen_urls: HashSet<u32> = HashSet::new();
        let mut duplicates_skipped = 0usize;
        let mut filtered_out = 0usize;
        let mut losses = 0usize;

        let mut in_batch = 0usize;
        let mut batches_flushed = 0usize;
        let mut navigable = false;

        while let Some(entry) = entries.next().await {
            let mut item = entry?;

            if !acceptable_url(&item.url) {
                filtered_out += 1;
                continue;
            }

            if self.options.remove_duplicates && !seen_urls.insert(fnv1a_32(item.url.as_bytes())) {
                duplicates_skipped += 1;
                continue;
            }

            // Series run-length encoding: one aggregate write per run
            match (&item.series_key, item.season_number, item.episode_number) {
                (Some(key), Some(season), Some(episode)) => {
                    item.series_id = Some(series.series_id_for(key));

                    let same_run = current_run
                        .as_ref()
                        .map(|run| &run.series_key == key)
                        .unwrap_or(false);
                    let run_full = current_run
                        .as_ref()
                        .map(|run| run.episodes.len() >= self.settings.series_chunk_size)
                        .unwrap_or(false);

                    if !same_run || run_full {
                        if let Some(run) = current_run.take() {
                            series.flush_run(run);
                        }
                        current_run = Some(SeriesRun {
                            series_key: key.clone(),
                            series_name: item.parsed_title.title.clone(),
                            group: item.group.clone(),
                            logo: item.logo.clone(),
                            year: item.parsed_title.year,
                            quality: item.parsed_title.quality.clone(),
                            episodes: Vec::new(),
                        });
                    }
                    if let Some(run) = current_run.as_mut() {
                        run.push(RunEpisode {
                            item_id: item.id.clone(),
                            season,
                            episode,
                        });
                    }
                }
                _ => {
                    // Any non-series (or keyless) item closes the open run
                    if let Some(run) = current_run.take() {
                        series.flush_run(run);
                    }
                }
            }

            stats.total_items += 1;
            match item.media_kind {
                MediaKind::Live => stats.live_count += 1,
                MediaKind::Movie => stats.movie_count += 1,
                MediaKind::Series => stats.series_count += 1,
                MediaKind::Unknown => stats.unknown_count += 1,
            }

            let group_id = format!(
                "group_{}",
                hash_url(&format!("{}|{}", item.group, item.media_kind))
            );
            let entry = groups.entry(group_id.clone()).or_insert_with(|| PlaylistGroup {
                id: group_id,
                name: item.group.clone(),
                media_kind: item.media_kind,
                item_count: 0,
                logo: None,
            });
            entry.item_count += 1;
            if entry.logo.is_none() {
                entry.logo = item.logo.clone();
            }
            stats.group_count = groups.len();

            // Append with a single retry, then count the loss; items are
            // never dropped silently
            if let Err(first_err) = writer.append_item(&item).await {
                tracing::warn!(error = %first_err, item = %item.id, "append failed, retrying");
                if let Err(second_err) = writer.append_item(&item).await {
                    tracing::error!(error = %second_err, item = %item.id, "item lost");
                    losses += 1;
                }
            }
            in_batch += 1;

            if in_batch >= self.settings.batch_size {
                in_batch = 0;
                batches_flushed += 1;

                writer.flush().await.map_err(ParseError::Cache)?;

                if writer.snapshot_due()
                    || (!navigable && writer.items_written() >= CAN_NAVIGATE_ITEMS)
                {
                    self.snapshot(writer, &stats, &groups, &series).await?;
                    if writer.items_written() >= CAN_NAVIGATE_ITEMS {
                        progress.set_can_navigate(&hash).await;
                        navigable = true;
                    }
                }

                progress.set_phase(&hash, ParsePhase::Indexing).await;
                progress
                    .set_counts(
                        &hash,
                        stats.total_items as u64,
                        groups.len() as u64,
                        series.len() as u64,
                    )
                    .await;

                // Cooperative yield; extra-long every gc_interval batches so
                // the allocator can actually reclaim
                if batches_flushed % self.settings.gc_interval == 0 {
                    tokio::task::yield_now().await;
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                } else {
                    tokio::task::yield_now().await;
                }

                if cancel.is_cancelled() {
                    return Err(ParseError::Cancelled);
                }
            }
        }

        // Close the trailing run and flush the final partial batch
        if let Some(run) = current_run.take() {
            series.flush_run(run);
        }
        writer.flush().await.map_err(ParseError::Cache)?;

        progress
            .set_counts(
                &hash,
                stats.total_items as u64,
                groups.len() as u64,
                series.len() as u64,
            )
            .await;

        if duplicates_skipped > 0 || filtered_out > 0 || losses > 0 {
            tracing::info!(
                duplicates_skipped,
                filtered_out,
                losses,
                "stream drained with drops"
            );
        }

        let mut groups: Vec<PlaylistGroup> = groups.into_values().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        Ok(BatchResult {
            stats,
            groups,
            series,
            duplicates_skipped,
            filtered_out,
            losses,
        })
    }

    async fn snapshot(
        &self,
        writer: &mut CacheWriter,
        stats: &PlaylistStats,
        groups: &HashMap<String, PlaylistGroup>,
        series: &SeriesAccumulator,
    ) -> Result<(), ParseError> {
        let mut groups_vec: Vec<PlaylistGroup> = groups.values().cloned().collect();
        groups_vec.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        writer
            .snapshot_meta(stats, groups_vec, series.stats())
            .await
            .map_err(ParseError::Cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParsingStatus, SeriesStats};
    use crate::services::cache::CacheStore;
    use crate::services::m3u_parser::entry_stream_from_reader;
    use std::collections::HashMap as StdHashMap;
    use std::io::Cursor;
    use tempfile::tempdir;
    use tokio::io::BufReader;

    fn stream_of(playlist: &str) -> EntryStream {
        entry_stream_from_reader(
            BufReader::new(Cursor::new(playlist.as_bytes().to_vec())),
            true,
        )
    }

    fn settings() -> BatchSettings {
        BatchSettings {
            batch_size: 2,
            gc_interval: 5,
            series_chunk_size: 10_000,
        }
    }

    async fn run_batch(playlist: &str) -> (BatchResult, CacheStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 7).await.unwrap();
        let mut writer = store.create_writer("testhash", "http://src").await.unwrap();
        let progress = ProgressTracker::new();
        progress.start("testhash").await;

        let processor = BatchProcessor::new(settings(), ParseOptions::default());
        let result = processor
            .process(
                stream_of(playlist),
                &mut writer,
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let stats = result.stats.clone();
        let groups = result.groups.clone();
        writer
            .finalize(stats, groups, vec![], SeriesStats::default(), &StdHashMap::new())
            .await
            .unwrap();

        (result, store, dir)
    }

    #[test]
    fn test_tier_settings() {
        let sizes = (250, 400, 1000);
        assert_eq!(
            BatchSettings::for_tier(DeviceTier::Tv, sizes).batch_size,
            250
        );
        assert_eq!(
            BatchSettings::for_tier(DeviceTier::Desktop, sizes).gc_interval,
            10
        );

        let low = BatchSettings::for_tier(DeviceTier::Desktop, sizes).adjust_for_memory(Some(150));
        assert_eq!(low.batch_size, 500);
        assert_eq!(low.gc_interval, 5);

        let critical =
            BatchSettings::for_tier(DeviceTier::Desktop, sizes).adjust_for_memory(Some(50));
        assert_eq!(critical.batch_size, 100);
        assert_eq!(critical.gc_interval, 3);
        assert_eq!(critical.series_chunk_size, 1_000);
    }

    #[test]
    fn test_fnv_is_stable() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), fnv1a_32(b"a"));
        assert_ne!(fnv1a_32(b"http://a"), fnv1a_32(b"http://b"));
    }

    #[test]
    fn test_url_filter() {
        assert!(acceptable_url("http://srv/live/1"));
        assert!(acceptable_url("https://srv/movie/1.mp4"));
        assert!(!acceptable_url("ftp://srv/file"));
        assert!(!acceptable_url("not a url"));
        assert!(!acceptable_url("http://srv/poster.jpg"));
        assert!(!acceptable_url("http://srv/pack.zip"));
    }

    #[tokio::test]
    async fn test_stats_and_group_counts_add_up() {
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"Canais\",Globo FHD\nhttp://srv/live/1\n\
            #EXTINF:-1 group-title=\"Canais\",SBT HD\nhttp://srv/live/2\n\
            #EXTINF:-1 group-title=\"Filmes\",Matrix (1999) Dublado\nhttp://srv/movie/3\n\
            #EXTINF:-1 group-title=\"S • AMC\",Breaking Bad S01E01\nhttp://srv/series/4\n";
        let (result, _store, _dir) = run_batch(playlist).await;

        assert_eq!(result.stats.total_items, 4);
        assert_eq!(result.stats.live_count, 2);
        assert_eq!(result.stats.movie_count, 1);
        assert_eq!(result.stats.series_count, 1);
        assert_eq!(result.stats.group_count, 3);

        // Sum of group itemCount equals totalItems
        let sum: usize = result.groups.iter().map(|g| g.item_count).sum();
        assert_eq!(sum, result.stats.total_items);
    }

    #[tokio::test]
    async fn test_duplicate_urls_skipped() {
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"Canais\",Globo FHD\nhttp://srv/live/1\n\
            #EXTINF:-1 group-title=\"Canais\",Globo FHD Alt\nhttp://srv/live/1\n";
        let (result, store, _dir) = run_batch(playlist).await;

        assert_eq!(result.stats.total_items, 1);
        assert_eq!(result.duplicates_skipped, 1);
        let items = store.read_items("testhash", 0, 10).await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_series_rle_aggregation() {
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"S • AMC\",Breaking Bad S01E01\nhttp://srv/series/1\n\
            #EXTINF:-1 group-title=\"S • AMC\",Breaking Bad S01E02\nhttp://srv/series/2\n\
            #EXTINF:-1 group-title=\"S • AMC\",Breaking Bad S02E01\nhttp://srv/series/3\n";
        let (result, store, _dir) = run_batch(playlist).await;

        assert_eq!(result.series.len(), 1);
        let series = result.series.into_series();
        let s = &series[0];
        assert_eq!(s.total_episodes, 3);
        assert_eq!(s.total_seasons, 2);
        assert_eq!(s.first_season, 1);
        assert_eq!(s.last_season, 2);
        assert_eq!(s.first_episode, 1);
        assert_eq!(s.last_episode, 2);

        // Every stored episode references the series aggregate
        let items = store.read_items("testhash", 0, 10).await.unwrap();
        for item in &items {
            assert_eq!(item.series_id.as_deref(), Some(s.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_filtered_urls_are_counted() {
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"Canais\",Globo FHD\nhttp://srv/live/1\n\
            #EXTINF:-1 group-title=\"Canais\",Capa\nhttp://srv/poster.jpg\n";
        let (result, _store, _dir) = run_batch(playlist).await;

        assert_eq!(result.stats.total_items, 1);
        assert_eq!(result.filtered_out, 1);
    }

    #[tokio::test]
    async fn test_snapshot_published_during_stream() {
        // 600 items with batch_size 2 forces the 500-item snapshot
        let mut playlist = String::from("#EXTM3U\n");
        for i in 0..600 {
            playlist.push_str(&format!(
                "#EXTINF:-1 group-title=\"Canais\",Canal {}\nhttp://srv/live/{}\n",
                i, i
            ));
        }

        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 7).await.unwrap();
        let mut writer = store.create_writer("snap", "http://src").await.unwrap();
        let progress = ProgressTracker::new();
        progress.start("snap").await;

        let processor = BatchProcessor::new(settings(), ParseOptions::default());
        processor
            .process(
                stream_of(&playlist),
                &mut writer,
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // The in-progress meta is readable mid-parse (writer still open)
        let meta = store.get("snap").await.unwrap();
        assert_eq!(meta.parsing_status, ParsingStatus::InProgress);
        assert!(meta.stats.total_items >= 500);
        assert!(!meta.groups.is_empty());
        assert!(meta.series.is_none());

        let snapshot = progress.get("snap").await.unwrap();
        assert!(snapshot.can_navigate);
        assert_eq!(snapshot.items_parsed, 600);
    }

    #[tokio::test]
    async fn test_cancellation_between_batches() {
        let mut playlist = String::from("#EXTM3U\n");
        for i in 0..50 {
            playlist.push_str(&format!(
                "#EXTINF:-1 group-title=\"Canais\",Canal {}\nhttp://srv/live/{}\n",
                i, i
            ));
        }

        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 7).await.unwrap();
        let mut writer = store.create_writer("cancel", "http://src").await.unwrap();
        let progress = ProgressTracker::new();
        progress.start("cancel").await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let processor = BatchProcessor::new(settings(), ParseOptions::default());
        let err = processor
            .process(stream_of(&playlist), &mut writer, &progress, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Cancelled));
    }
}
