use serde::{Deserialize, Serialize};

/// Media type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Live,
    Movie,
    Series,
    Unknown,
}

impl Default for MediaKind {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Live => write!(f, "live"),
            MediaKind::Movie => write!(f, "movie"),
            MediaKind::Series => write!(f, "series"),
            MediaKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Parsed title metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTitle {
    pub title: String,
    /// Cleaned title in uppercase, kept for substring search
    #[serde(default)]
    pub title_normalized: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub is_multi_audio: bool,
    #[serde(default)]
    pub is_dubbed: bool,
    #[serde(default)]
    pub is_subbed: bool,
}

/// Extracted series info from title pattern (SxxExx, 1x01, T01E01)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedSeriesInfo {
    pub series_name: String,
    pub season: u8,
    pub episode: u16,
}

/// Single playlist item (channel/movie/episode)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    pub group: String,
    pub media_kind: MediaKind,
    pub parsed_title: ParsedTitle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xui_id: Option<String>,
    /// Present iff media_kind == series and a season+episode was detected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season_number: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_number: Option<u16>,
}

/// Group/category information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistGroup {
    pub id: String,
    pub name: String,
    pub media_kind: MediaKind,
    pub item_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
}

/// Series metadata (grouped episodes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    pub group: String,
    pub total_episodes: usize,
    pub total_seasons: usize,
    pub first_season: u16,
    pub last_season: u16,
    pub first_episode: u16,
    pub last_episode: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

/// Playlist statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistStats {
    pub total_items: usize,
    pub live_count: usize,
    pub movie_count: usize,
    pub series_count: usize,
    pub unknown_count: usize,
    pub group_count: usize,
}

/// Aggregate series counters, safe to publish while a parse is still running
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesStats {
    pub total_series: usize,
    pub total_episodes: usize,
    pub avg_episodes_per_series: f64,
}

impl SeriesStats {
    pub fn from_counts(total_series: usize, total_episodes: usize) -> Self {
        let avg = if total_series == 0 {
            0.0
        } else {
            total_episodes as f64 / total_series as f64
        };
        Self {
            total_series,
            total_episodes,
            avg_episodes_per_series: (avg * 100.0).round() / 100.0,
        }
    }
}

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingStatus {
    InProgress,
    Completed,
}

/// Cache metadata stored in .meta.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub hash: String,
    pub url: String,
    pub stats: PlaylistStats,
    pub groups: Vec<PlaylistGroup>,
    pub series_stats: SeriesStats,
    /// Full series table; written once, at completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<Vec<SeriesInfo>>,
    pub parsing_status: ParsingStatus,
    pub created_at: i64,
    pub expires_at: i64,
}

impl CacheMetadata {
    pub fn is_completed(&self) -> bool {
        self.parsing_status == ParsingStatus::Completed
    }
}

/// Device tier hint for adaptive batching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTier {
    Tv,
    Mobile,
    Desktop,
}

impl Default for DeviceTier {
    fn default() -> Self {
        Self::Tv
    }
}

/// Request to parse a playlist
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseRequest {
    pub url: String,
    #[serde(default)]
    pub options: ParseOptions,
}

/// Parsing options
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseOptions {
    /// Include the groups table in the submit response payload
    #[serde(default = "default_true")]
    pub include_groups: bool,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default = "default_true")]
    pub remove_duplicates: bool,
    #[serde(default)]
    pub device_tier: DeviceTier,
    /// Optional submission deadline; the worker aborts past it
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            include_groups: true,
            normalize: true,
            remove_duplicates: true,
            device_tier: DeviceTier::default(),
            deadline_ms: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Response to a parse submission (cache hit or queued job)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseSubmitResponse {
    pub success: bool,
    pub cached: bool,
    pub queued: bool,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<CacheMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

/// Paginated items response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsResponse {
    pub items: Vec<PlaylistItem>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// Groups response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupsResponse {
    pub groups: Vec<PlaylistGroup>,
    pub total: usize,
}

/// Series response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesResponse {
    pub series: Vec<SeriesInfo>,
    pub total: usize,
}

/// Query parameters for items endpoint
#[derive(Debug, Deserialize)]
pub struct ItemsQuery {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub media_kind: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_serde() {
        let json = serde_json::to_string(&MediaKind::Series).unwrap();
        assert_eq!(json, "\"series\"");
        let kind: MediaKind = serde_json::from_str("\"live\"").unwrap();
        assert_eq!(kind, MediaKind::Live);
    }

    #[test]
    fn test_parsing_status_serde() {
        assert_eq!(
            serde_json::to_string(&ParsingStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&ParsingStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_parse_options_defaults() {
        let options: ParseOptions = serde_json::from_str("{}").unwrap();
        assert!(options.include_groups);
        assert!(options.normalize);
        assert!(options.remove_duplicates);
        assert_eq!(options.device_tier, DeviceTier::Tv);
        assert_eq!(options.deadline_ms, None);

        let options: ParseOptions =
            serde_json::from_str(r#"{"includeGroups": false, "normalize": false}"#).unwrap();
        assert!(!options.include_groups);
        assert!(!options.normalize);
        assert!(options.remove_duplicates);
    }

    #[test]
    fn test_series_stats_avg() {
        let stats = SeriesStats::from_counts(4, 10);
        assert_eq!(stats.avg_episodes_per_series, 2.5);
        let empty = SeriesStats::from_counts(0, 0);
        assert_eq!(empty.avg_episodes_per_series, 0.0);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let meta = CacheMetadata {
            hash: "abc".into(),
            url: "http://example.com/list.m3u".into(),
            stats: PlaylistStats::default(),
            groups: vec![],
            series_stats: SeriesStats::default(),
            series: Some(vec![]),
            parsing_status: ParsingStatus::Completed,
            created_at: 1000,
            expires_at: 2000,
        };
        let json = serde_json::to_string_pretty(&meta).unwrap();
        let back: CacheMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash, meta.hash);
        assert!(back.is_completed());
        assert_eq!(serde_json::to_string_pretty(&back).unwrap(), json);
    }
}
