use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::RwLock;

use crate::error::CacheError;
use crate::models::{
    CacheMetadata, ParsingStatus, PlaylistGroup, PlaylistItem, PlaylistStats, SeriesStats,
};

/// In-progress meta snapshots are refreshed every N persisted items
const SNAPSHOT_EVERY_ITEMS: usize = 1000;

/// Result of a metadata lookup
#[derive(Debug)]
pub enum CacheLookup {
    Found(CacheMetadata),
    Expired,
    Missing,
}

/// Content-addressed cache over the local filesystem.
///
/// Per playlist hash H three artifacts live in the cache directory:
/// `H.ndjson` (one item per line, stream order), `H.idx` (one decimal byte
/// offset per line, lock-step with the ndjson) and `H.meta.json` (atomic
/// temp+rename writes). An in-memory index maps hash -> metadata and is
/// shared read-mostly across handlers.
pub struct CacheStore {
    cache_dir: PathBuf,
    ttl_days: i64,
    index: Arc<RwLock<HashMap<String, CacheMetadata>>>,
}

impl Clone for CacheStore {
    fn clone(&self) -> Self {
        Self {
            cache_dir: self.cache_dir.clone(),
            ttl_days: self.ttl_days,
            index: Arc::clone(&self.index),
        }
    }
}

impl CacheStore {
    /// Create the store and run the startup recovery scan
    pub async fn new(cache_dir: &str, ttl_days: i64) -> Result<Self, CacheError> {
        let cache_dir = PathBuf::from(cache_dir);
        fs::create_dir_all(&cache_dir).await?;

        let store = Self {
            cache_dir,
            ttl_days,
            index: Arc::new(RwLock::new(HashMap::new())),
        };

        store.recover().await?;
        Ok(store)
    }

    /// Enumerate the cache directory, load valid completed entries and
    /// remove everything else: expired entries, orphan data files, stale
    /// `in_progress` metas from crashed runs, leftover temp files.
    async fn recover(&self) -> Result<(), CacheError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut metas: HashMap<String, CacheMetadata> = HashMap::new();
        let mut data_hashes: Vec<String> = Vec::new();

        let mut entries = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            if name.ends_with(".tmp") {
                let _ = fs::remove_file(&path).await;
                continue;
            }

            if let Some(hash) = name.strip_suffix(".meta.json") {
                match fs::read_to_string(&path).await {
                    Ok(content) => match serde_json::from_str::<CacheMetadata>(&content) {
                        Ok(meta) => {
                            metas.insert(hash.to_string(), meta);
                        }
                        Err(e) => {
                            tracing::warn!("metadata inválido em {}: {}", path.display(), e);
                        }
                    },
                    Err(e) => {
                        tracing::warn!("falha lendo {}: {}", path.display(), e);
                    }
                }
            } else if let Some(hash) = name.strip_suffix(".ndjson") {
                data_hashes.push(hash.to_string());
            }
        }

        let mut kept = 0usize;
        let mut index = self.index.write().await;
        for (hash, meta) in metas {
            let valid = meta.is_completed()
                && meta.expires_at > now
                && fs::try_exists(self.items_path(&hash)).await.unwrap_or(false);
            if valid {
                index.insert(hash, meta);
                kept += 1;
            } else {
                drop_entry_files(&self.cache_dir, &hash).await;
            }
        }
        // Data files without a surviving meta are orphans
        for hash in data_hashes {
            if !index.contains_key(&hash) {
                drop_entry_files(&self.cache_dir, &hash).await;
            }
        }
        drop(index);

        tracing::info!(cached_playlists = kept, "cache recovery complete");
        Ok(())
    }

    /// Lookup that distinguishes a miss from an expired entry, so the REST
    /// surface can answer 404 vs 410. Expired entries are removed on the
    /// way out.
    pub async fn lookup(&self, hash: &str) -> CacheLookup {
        let now = chrono::Utc::now().timestamp_millis();

        let in_memory = {
            let index = self.index.read().await;
            index.get(hash).cloned()
        };
        if let Some(meta) = in_memory {
            if meta.expires_at > now {
                return CacheLookup::Found(meta);
            }
            self.delete_entry(hash).await;
            return CacheLookup::Expired;
        }

        match fs::read_to_string(self.meta_path(hash)).await {
            Ok(content) => match serde_json::from_str::<CacheMetadata>(&content) {
                Ok(meta) if meta.expires_at > now => {
                    let mut index = self.index.write().await;
                    index.insert(hash.to_string(), meta.clone());
                    CacheLookup::Found(meta)
                }
                Ok(_) => {
                    self.delete_entry(hash).await;
                    CacheLookup::Expired
                }
                Err(_) => {
                    self.delete_entry(hash).await;
                    CacheLookup::Missing
                }
            },
            Err(_) => CacheLookup::Missing,
        }
    }

    /// Metadata by hash: memory first, then disk, none when expired.
    /// Expired entries are removed on the way out.
    pub async fn get(&self, hash: &str) -> Option<CacheMetadata> {
        match self.lookup(hash).await {
            CacheLookup::Found(meta) => Some(meta),
            _ => None,
        }
    }

    /// Open a writer for a fresh parse of `hash`. Truncates any partial
    /// artifacts a previous attempt left behind.
    pub async fn create_writer(&self, hash: &str, url: &str) -> Result<CacheWriter, CacheError> {
        let created_at = chrono::Utc::now().timestamp_millis();
        let expires_at = created_at + self.ttl_days * 24 * 60 * 60 * 1000;

        let ndjson = BufWriter::with_capacity(64 * 1024, File::create(self.items_path(hash)).await?);
        let idx = BufWriter::with_capacity(16 * 1024, File::create(self.idx_path(hash)).await?);

        Ok(CacheWriter {
            store: self.clone(),
            hash: hash.to_string(),
            url: url.to_string(),
            created_at,
            expires_at,
            ndjson,
            idx,
            byte_pos: 0,
            items_written: 0,
            last_snapshot: 0,
        })
    }

    /// Random-access page: seek via the idx, then read `limit` contiguous
    /// lines. O(limit) data I/O regardless of playlist size.
    pub async fn read_items(
        &self,
        hash: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PlaylistItem>, CacheError> {
        let offsets = self.read_offsets(hash, offset, limit).await?;
        let first = match offsets.first() {
            Some(o) => *o,
            None => return Ok(Vec::new()),
        };

        let mut file = File::open(self.items_path(hash)).await?;
        file.seek(SeekFrom::Start(first)).await?;
        let mut reader = BufReader::new(file);

        let mut items = Vec::with_capacity(offsets.len());
        let mut line = String::new();
        for _ in 0..offsets.len() {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            match serde_json::from_str::<PlaylistItem>(line.trim_end()) {
                Ok(item) => items.push(item),
                // Torn tail while a writer is mid-flush; idx ordering makes
                // this unreachable for indexed lines, stop defensively.
                Err(_) => break,
            }
        }
        Ok(items)
    }

    /// Safe partial read while parsing is still in progress
    pub async fn read_preview(
        &self,
        hash: &str,
        limit: usize,
    ) -> Result<Vec<PlaylistItem>, CacheError> {
        self.read_items(hash, 0, limit).await
    }

    /// Filtered scan with early termination once `limit` matches are
    /// collected past `offset`. Returns (page, total_matching).
    pub async fn read_items_filtered(
        &self,
        hash: &str,
        offset: usize,
        limit: usize,
        group: Option<&str>,
        media_kind: Option<&str>,
    ) -> Result<(Vec<PlaylistItem>, usize), CacheError> {
        let mut items = Vec::with_capacity(limit.min(256));
        let mut total_matching = 0usize;

        self.scan(hash, |item| {
            let matches_group = group
                .map(|g| item.group.eq_ignore_ascii_case(g))
                .unwrap_or(true);
            let matches_kind = media_kind
                .map(|k| item.media_kind.to_string().eq_ignore_ascii_case(k))
                .unwrap_or(true);

            if matches_group && matches_kind {
                if total_matching >= offset && items.len() < limit {
                    items.push(item);
                }
                total_matching += 1;
            }
            true
        })
        .await?;

        Ok((items, total_matching))
    }

    /// Case-insensitive substring search over the normalized title
    pub async fn search_items(
        &self,
        hash: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PlaylistItem>, CacheError> {
        let needle = query.trim().to_uppercase();
        let mut items = Vec::new();

        self.scan(hash, |item| {
            if item.parsed_title.title_normalized.contains(&needle)
                || item.name.to_uppercase().contains(&needle)
            {
                items.push(item);
            }
            items.len() < limit
        })
        .await?;

        Ok(items)
    }

    /// Episodes of one series, ordered by (season, episode)
    pub async fn series_episodes(
        &self,
        hash: &str,
        series_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<PlaylistItem>, usize), CacheError> {
        let mut episodes = Vec::new();

        self.scan(hash, |item| {
            if item.series_id.as_deref() == Some(series_id) {
                episodes.push(item);
            }
            true
        })
        .await?;

        episodes.sort_by_key(|e| (e.season_number.unwrap_or(0), e.episode_number.unwrap_or(0)));
        let total = episodes.len();
        let page = episodes.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    /// Sequential scan over the ndjson; the visitor returns false to stop.
    /// Tolerates a torn final line while a writer is active.
    async fn scan<F>(&self, hash: &str, mut visit: F) -> Result<(), CacheError>
    where
        F: FnMut(PlaylistItem) -> bool,
    {
        let file = match File::open(self.items_path(hash)).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<PlaylistItem>(trimmed) {
                Ok(item) => {
                    if !visit(item) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Read idx entries [offset, offset+limit); O(offset+limit) small reads
    async fn read_offsets(
        &self,
        hash: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<u64>, CacheError> {
        let file = match File::open(self.idx_path(hash)).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut offsets = Vec::with_capacity(limit);
        let mut index = 0usize;

        while offsets.len() < limit {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            if index >= offset {
                match line.trim_end().parse::<u64>() {
                    Ok(pos) => offsets.push(pos),
                    Err(_) => break,
                }
            }
            index += 1;
        }
        Ok(offsets)
    }

    /// Count of persisted (indexed) items; tracks the writer during a parse
    pub async fn persisted_count(&self, hash: &str) -> Result<usize, CacheError> {
        let file = match File::open(self.idx_path(hash)).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut count = 0usize;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            if !line.trim_end().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove all artifacts and the index entry for a hash
    pub async fn delete_entry(&self, hash: &str) {
        drop_entry_files(&self.cache_dir, hash).await;
        let mut index = self.index.write().await;
        index.remove(hash);
    }

    /// Drop every expired entry; returns how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let expired: Vec<String> = {
            let index = self.index.read().await;
            index
                .iter()
                .filter(|(_, meta)| meta.expires_at <= now)
                .map(|(hash, _)| hash.clone())
                .collect()
        };

        for hash in &expired {
            self.delete_entry(hash).await;
        }
        expired.len()
    }

    pub async fn entry_count(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn disk_usage_bytes(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(mut entries) = fs::read_dir(&self.cache_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(metadata) = entry.metadata().await {
                    total += metadata.len();
                }
            }
        }
        total
    }

    /// Atomic meta write: temp file, fsync, rename, index refresh
    async fn write_meta_atomic(&self, meta: &CacheMetadata) -> Result<(), CacheError> {
        let path = self.meta_path(&meta.hash);
        let tmp_path = self.meta_tmp_path(&meta.hash);
        let content = serde_json::to_string_pretty(meta)?;

        let mut file = File::create(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &path).await?;

        let mut index = self.index.write().await;
        index.insert(meta.hash.clone(), meta.clone());
        Ok(())
    }

    // ============ Path Helpers ============

    fn items_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.ndjson", hash))
    }

    fn items_tmp_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.ndjson.tmp", hash))
    }

    fn idx_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.idx", hash))
    }

    fn idx_tmp_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.idx.tmp", hash))
    }

    fn meta_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.meta.json", hash))
    }

    fn meta_tmp_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.meta.json.tmp", hash))
    }
}

async fn drop_entry_files(cache_dir: &std::path::Path, hash: &str) {
    for suffix in [".ndjson", ".idx", ".meta.json", ".ndjson.tmp", ".idx.tmp", ".meta.json.tmp"] {
        let _ = fs::remove_file(cache_dir.join(format!("{}{}", hash, suffix))).await;
    }
}

/// Exclusive writer for one hash while its parse runs.
///
/// Item lines and their byte offsets are buffered together and flushed in
/// lock-step: the ndjson bytes always hit the file before the offsets that
/// reference them, so the idx can never run ahead of the data.
pub struct CacheWriter {
    store: CacheStore,
    hash: String,
    url: String,
    created_at: i64,
    expires_at: i64,
    ndjson: BufWriter<File>,
    idx: BufWriter<File>,
    byte_pos: u64,
    items_written: usize,
    last_snapshot: usize,
}

impl CacheWriter {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn items_written(&self) -> usize {
        self.items_written
    }

    /// Append one item line plus its offset record
    pub async fn append_item(&mut self, item: &PlaylistItem) -> Result<(), CacheError> {
        let line = serde_json::to_vec(item)?;
        let offset = self.byte_pos;

        self.ndjson.write_all(&line).await?;
        self.ndjson.write_all(b"\n").await?;
        self.byte_pos += line.len() as u64 + 1;

        self.idx
            .write_all(format!("{}\n", offset).as_bytes())
            .await?;

        self.items_written += 1;
        Ok(())
    }

    /// Flush buffered lines, data before offsets
    pub async fn flush(&mut self) -> Result<(), CacheError> {
        self.ndjson.flush().await?;
        self.idx.flush().await?;
        Ok(())
    }

    /// True when enough items accumulated since the last meta snapshot
    pub fn snapshot_due(&self) -> bool {
        self.items_written >= self.last_snapshot + SNAPSHOT_EVERY_ITEMS
    }

    /// Publish an in-progress meta snapshot (stats, groups and series
    /// counters only; the full series table waits for completion)
    pub async fn snapshot_meta(
        &mut self,
        stats: &PlaylistStats,
        groups: Vec<PlaylistGroup>,
        series_stats: SeriesStats,
    ) -> Result<(), CacheError> {
        self.flush().await?;
        self.last_snapshot = self.items_written;

        let meta = CacheMetadata {
            hash: self.hash.clone(),
            url: self.url.clone(),
            stats: stats.clone(),
            groups,
            series_stats,
            series: None,
            parsing_status: ParsingStatus::InProgress,
            created_at: self.created_at,
            expires_at: self.expires_at,
        };
        self.store.write_meta_atomic(&meta).await
    }

    /// Complete the entry: flush and sync both files, apply fuzzy-merge
    /// remaps through a streaming rewrite when present, then publish the
    /// final metadata. The entry is immutable afterwards.
    pub async fn finalize(
        mut self,
        stats: PlaylistStats,
        groups: Vec<PlaylistGroup>,
        series: Vec<crate::models::SeriesInfo>,
        series_stats: SeriesStats,
        remaps: &HashMap<String, String>,
    ) -> Result<CacheMetadata, CacheError> {
        self.ndjson.flush().await?;
        self.ndjson.get_ref().sync_all().await?;
        self.idx.flush().await?;
        self.idx.get_ref().sync_all().await?;

        if !remaps.is_empty() {
            self.rewrite_with_remaps(remaps).await?;
        }

        let meta = CacheMetadata {
            hash: self.hash.clone(),
            url: self.url.clone(),
            stats,
            groups,
            series_stats,
            series: Some(series),
            parsing_status: ParsingStatus::Completed,
            created_at: self.created_at,
            expires_at: self.expires_at,
        };
        self.store.write_meta_atomic(&meta).await?;
        Ok(meta)
    }

    /// Stream the ndjson through a temp rewrite patching `series_id` on the
    /// remapped items, rebuild the idx, and rename both over the originals.
    async fn rewrite_with_remaps(
        &mut self,
        remaps: &HashMap<String, String>,
    ) -> Result<(), CacheError> {
        let items_path = self.store.items_path(&self.hash);
        let items_tmp = self.store.items_tmp_path(&self.hash);
        let idx_tmp = self.store.idx_tmp_path(&self.hash);

        let reader_file = File::open(&items_path).await?;
        let mut reader = BufReader::new(reader_file);
        let mut ndjson = BufWriter::with_capacity(64 * 1024, File::create(&items_tmp).await?);
        let mut idx = BufWriter::with_capacity(16 * 1024, File::create(&idx_tmp).await?);

        let mut line = String::new();
        let mut byte_pos = 0u64;
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }

            // Untouched lines are copied verbatim to keep the file
            // byte-stable across re-parses
            let out: Vec<u8> = {
                let mut item: PlaylistItem = serde_json::from_str(trimmed)?;
                match remaps.get(&item.id) {
                    Some(series_id) => {
                        item.series_id = Some(series_id.clone());
                        serde_json::to_vec(&item)?
                    }
                    None => trimmed.as_bytes().to_vec(),
                }
            };

            idx.write_all(format!("{}\n", byte_pos).as_bytes()).await?;
            ndjson.write_all(&out).await?;
            ndjson.write_all(b"\n").await?;
            byte_pos += out.len() as u64 + 1;
        }

        ndjson.flush().await?;
        ndjson.get_ref().sync_all().await?;
        idx.flush().await?;
        idx.get_ref().sync_all().await?;
        drop(ndjson);
        drop(idx);

        fs::rename(&items_tmp, &items_path).await?;
        fs::rename(&idx_tmp, self.store.idx_path(&self.hash)).await?;
        Ok(())
    }

    /// Discard the attempt: remove artifacts and the index entry
    pub async fn abort(self) {
        drop(self.ndjson);
        drop(self.idx);
        self.store.delete_entry(&self.hash).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MediaKind, ParsedTitle};
    use tempfile::tempdir;

    fn item(id: &str, name: &str, group: &str, kind: MediaKind) -> PlaylistItem {
        PlaylistItem {
            id: id.to_string(),
            name: name.to_string(),
            url: format!("http://srv/{}", id),
            logo: None,
            group: group.to_string(),
            media_kind: kind,
            parsed_title: ParsedTitle {
                title: name.to_string(),
                title_normalized: name.to_uppercase(),
                ..Default::default()
            },
            epg_id: None,
            xui_id: None,
            series_key: None,
            series_id: None,
            season_number: None,
            episode_number: None,
        }
    }

    async fn store(dir: &tempfile::TempDir) -> CacheStore {
        CacheStore::new(dir.path().to_str().unwrap(), 7)
            .await
            .unwrap()
    }

    async fn write_entry(store: &CacheStore, hash: &str, count: usize) -> CacheMetadata {
        let mut writer = store.create_writer(hash, "http://src/list.m3u").await.unwrap();
        for i in 0..count {
            writer
                .append_item(&item(&format!("id{}", i), &format!("Canal {}", i), "TV", MediaKind::Live))
                .await
                .unwrap();
        }
        let stats = PlaylistStats {
            total_items: count,
            live_count: count,
            ..Default::default()
        };
        writer
            .finalize(stats, vec![], vec![], SeriesStats::default(), &HashMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_idx_offsets_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        write_entry(&store, "aaa", 20).await;

        // Every idx entry must be the byte offset of its ndjson line
        let ndjson = std::fs::read_to_string(dir.path().join("aaa.ndjson")).unwrap();
        let idx = std::fs::read_to_string(dir.path().join("aaa.idx")).unwrap();
        let lines: Vec<&str> = ndjson.lines().collect();
        let offsets: Vec<u64> = idx.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(lines.len(), offsets.len());

        for (k, offset) in offsets.iter().enumerate() {
            let from_offset = &ndjson[*offset as usize..];
            let line = from_offset.split('\n').next().unwrap();
            assert_eq!(line, lines[k], "offset {} line {}", offset, k);
        }
    }

    #[tokio::test]
    async fn test_read_items_pagination() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        write_entry(&store, "bbb", 30).await;

        let page = store.read_items("bbb", 10, 5).await.unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].id, "id10");
        assert_eq!(page[4].id, "id14");

        // Past the end
        let tail = store.read_items("bbb", 28, 10).await.unwrap();
        assert_eq!(tail.len(), 2);
        let empty = store.read_items("bbb", 100, 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_partial_read_during_parse() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let mut writer = store.create_writer("ccc", "http://src").await.unwrap();

        for i in 0..10 {
            writer
                .append_item(&item(&format!("id{}", i), "X", "TV", MediaKind::Live))
                .await
                .unwrap();
        }
        writer
            .snapshot_meta(&PlaylistStats::default(), vec![], SeriesStats::default())
            .await
            .unwrap();

        // Buffered but unflushed items are not yet visible
        writer
            .append_item(&item("id10", "X", "TV", MediaKind::Live))
            .await
            .unwrap();

        let preview = store.read_preview("ccc", 500).await.unwrap();
        assert_eq!(preview.len(), 10);
        assert_eq!(store.persisted_count("ccc").await.unwrap(), 10);

        let meta = store.get("ccc").await.unwrap();
        assert_eq!(meta.parsing_status, ParsingStatus::InProgress);
    }

    #[tokio::test]
    async fn test_filtered_scan() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let mut writer = store.create_writer("ddd", "http://src").await.unwrap();
        for i in 0..10 {
            let kind = if i % 2 == 0 { MediaKind::Live } else { MediaKind::Movie };
            let group = if i % 2 == 0 { "TV" } else { "Filmes" };
            writer
                .append_item(&item(&format!("id{}", i), &format!("N{}", i), group, kind))
                .await
                .unwrap();
        }
        writer
            .finalize(
                PlaylistStats::default(),
                vec![],
                vec![],
                SeriesStats::default(),
                &HashMap::new(),
            )
            .await
            .unwrap();

        let (movies, total) = store
            .read_items_filtered("ddd", 0, 10, None, Some("movie"))
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert!(movies.iter().all(|i| i.media_kind == MediaKind::Movie));

        let (page, total) = store
            .read_items_filtered("ddd", 1, 2, Some("Filmes"), None)
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "id3");
    }

    #[tokio::test]
    async fn test_search() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let mut writer = store.create_writer("eee", "http://src").await.unwrap();
        writer
            .append_item(&item("a", "Globo News", "TV", MediaKind::Live))
            .await
            .unwrap();
        writer
            .append_item(&item("b", "Record News", "TV", MediaKind::Live))
            .await
            .unwrap();
        writer
            .append_item(&item("c", "Matrix", "Filmes", MediaKind::Movie))
            .await
            .unwrap();
        writer
            .finalize(
                PlaylistStats::default(),
                vec![],
                vec![],
                SeriesStats::default(),
                &HashMap::new(),
            )
            .await
            .unwrap();

        let hits = store.search_items("eee", "news", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        let limited = store.search_items("eee", "news", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_with_remaps_rewrites_series_id() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let mut writer = store.create_writer("fff", "http://src").await.unwrap();

        let mut ep = item("ep1", "Show S01E01", "S • X", MediaKind::Series);
        ep.series_id = Some("fff_old".to_string());
        writer.append_item(&ep).await.unwrap();
        writer
            .append_item(&item("other", "Canal", "TV", MediaKind::Live))
            .await
            .unwrap();

        let mut remaps = HashMap::new();
        remaps.insert("ep1".to_string(), "fff_anchor".to_string());
        writer
            .finalize(
                PlaylistStats::default(),
                vec![],
                vec![],
                SeriesStats::default(),
                &remaps,
            )
            .await
            .unwrap();

        let items = store.read_items("fff", 0, 10).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].series_id.as_deref(), Some("fff_anchor"));
        assert_eq!(items[1].series_id, None);

        // idx still valid after the rewrite
        let (eps, total) = store.series_episodes("fff", "fff_anchor", 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(eps[0].id, "ep1");
    }

    #[tokio::test]
    async fn test_recovery_removes_orphans_and_stale() {
        let dir = tempdir().unwrap();
        {
            let store = store(&dir).await;
            write_entry(&store, "keep", 3).await;

            // Orphan ndjson without meta
            std::fs::write(dir.path().join("orphan.ndjson"), "{}\n").unwrap();
            // Stale in-progress meta from a crashed run
            let mut writer = store.create_writer("stale", "http://src").await.unwrap();
            writer
                .append_item(&item("x", "X", "TV", MediaKind::Live))
                .await
                .unwrap();
            writer
                .snapshot_meta(&PlaylistStats::default(), vec![], SeriesStats::default())
                .await
                .unwrap();
        }

        let store = store(&dir).await;
        assert!(store.get("keep").await.is_some());
        assert!(store.get("stale").await.is_none());
        assert!(!dir.path().join("orphan.ndjson").exists());
        assert!(!dir.path().join("stale.ndjson").exists());
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_removed_at_read() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 0).await.unwrap();
        write_entry(&store, "old", 2).await;

        // ttl_days = 0 makes the entry instantly expired
        assert!(store.get("old").await.is_none());
        assert!(!dir.path().join("old.meta.json").exists());
    }

    #[tokio::test]
    async fn test_empty_playlist_completes() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let meta = write_entry(&store, "zero", 0).await;
        assert!(meta.is_completed());
        assert_eq!(meta.stats.total_items, 0);
        assert!(store.read_items("zero", 0, 10).await.unwrap().is_empty());
    }
}
