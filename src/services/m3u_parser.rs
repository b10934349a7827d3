use async_stream::try_stream;
use futures::Stream;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Client, Response};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;

use crate::error::ParseError;
use crate::models::{MediaKind, PlaylistItem};
use crate::services::classifier::ContentClassifier;
use crate::services::series_grouper;

// Defensive limits for streamed parsing
const MAX_LINE_BYTES: usize = 32 * 1024;
const READ_LINE_TIMEOUT: Duration = Duration::from_secs(10);

lazy_static! {
    /// Collapse runs of whitespace into a single space
    static ref MULTI_SPACE_REGEX: Regex = Regex::new(r"\s{2,}").unwrap();
    /// EXTINF attributes (tvg-id="...", group-title="...", etc)
    static ref ATTR_REGEX: Regex = Regex::new(r#"(\w+(?:-\w+)*)="([^"]*)""#).unwrap();
    /// Duration prefix of the EXTINF header
    static ref DURATION_REGEX: Regex = Regex::new(r"^-?\d+").unwrap();
}

/// Parsed EXTINF line data
#[derive(Debug, Default)]
struct ExtinfData {
    _duration: i32,
    attributes: HashMap<String, String>,
    title: String,
}

/// Parse an EXTINF line
/// Format: #EXTINF:duration tvg-id="..." tvg-logo="..." group-title="...",Title
fn parse_extinf(line: &str) -> Option<ExtinfData> {
    if !line.starts_with("#EXTINF:") {
        return None;
    }

    let content = &line[8..];
    let first_comma = content.find(',')?;

    let header = &content[..first_comma];
    let title = content[first_comma + 1..].trim().to_string();

    let duration = DURATION_REGEX
        .find(header)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1);

    let mut attributes = HashMap::new();
    for caps in ATTR_REGEX.captures_iter(header) {
        let key = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let value = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
        attributes.insert(key, value);
    }

    Some(ExtinfData {
        _duration: duration,
        attributes,
        title,
    })
}

/// SHA1 hash of a URL, hex-encoded. Stable identity for cache and lock keys.
pub fn hash_url(url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First 12 hex chars of the SHA1 of `input`; used for derived ids
pub fn short_hash(input: &str) -> String {
    hash_url(input)[..12].to_string()
}

/// Stable item id: short hash over the identifying attributes plus the
/// stream ordinal.
fn generate_item_id(
    tvg_id: Option<&str>,
    xui_id: Option<&str>,
    url: &str,
    ordinal: usize,
) -> String {
    let basis = format!(
        "{}|{}|{}",
        tvg_id.unwrap_or(""),
        xui_id.unwrap_or(""),
        url
    );
    format!("{}_{}", short_hash(&basis), ordinal)
}

/// Trim and collapse internal whitespace
fn normalize_text(text: &str) -> String {
    let trimmed = text.trim();
    MULTI_SPACE_REGEX.replace_all(trimmed, " ").to_string()
}

/// Build a full item from a pending EXTINF and its URL line
fn build_item(extinf: ExtinfData, stream_url: String, ordinal: usize, normalize: bool) -> PlaylistItem {
    let raw_name = extinf.title;
    let raw_group = extinf
        .attributes
        .get("group-title")
        .map(|s| s.as_str())
        .unwrap_or("Sem Grupo");

    let (name, group) = if normalize {
        (normalize_text(&raw_name), normalize_text(raw_group))
    } else {
        (raw_name, raw_group.to_string())
    };

    let epg_id = extinf.attributes.get("tvg-id").cloned().filter(|s| !s.is_empty());
    let xui_id = extinf.attributes.get("xui-id").cloned().filter(|s| !s.is_empty());
    let logo = extinf.attributes.get("tvg-logo").cloned().filter(|s| !s.is_empty());

    let media_kind = ContentClassifier::classify(&name, &group, &stream_url);
    let mut parsed_title = ContentClassifier::parse_title(&name);

    // Series identity only when the kind is series AND a season+episode
    // pattern is present; the key feeds the run-length grouper downstream.
    let (series_key, season_number, episode_number) = if media_kind == MediaKind::Series {
        match ContentClassifier::extract_series_info(&name) {
            Some(info) => {
                parsed_title.season = Some(info.season);
                parsed_title.episode = Some(info.episode);
                let key =
                    series_grouper::make_series_key(&info.series_name, &group, parsed_title.year);
                (Some(key), Some(info.season), Some(info.episode))
            }
            None => (None, None, None),
        }
    } else {
        (None, None, None)
    };

    let id = generate_item_id(epg_id.as_deref(), xui_id.as_deref(), &stream_url, ordinal);

    PlaylistItem {
        id,
        name,
        url: stream_url,
        logo,
        group,
        media_kind,
        parsed_title,
        epg_id,
        xui_id,
        series_key,
        series_id: None,
        season_number,
        episode_number,
    }
}

/// Lazily parsed M3U entries, in exact source order
pub type EntryStream = Pin<Box<dyn Stream<Item = Result<PlaylistItem, ParseError>> + Send>>;

/// Line loop over any buffered reader; yields one item per EXTINF+URL pair.
/// A missing #EXTM3U header is only warned about at EOF; the final entry is
/// emitted even without a trailing newline.
pub fn entry_stream_from_reader<R>(reader: R, normalize: bool) -> EntryStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(try_stream! {
        let mut reader = reader;
        let mut line = String::new();
        let mut current_extinf: Option<ExtinfData> = None;
        let mut ordinal = 0usize;
        let mut found_header = false;

        loop {
            line.clear();

            let read_result =
                tokio::time::timeout(READ_LINE_TIMEOUT, reader.read_line(&mut line)).await;

            let bytes_read = match read_result {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => Err(ParseError::Network(e.to_string()))?,
                Err(_) => Err(ParseError::Timeout)?,
            };

            if bytes_read == 0 {
                break;
            }

            if line.len() > MAX_LINE_BYTES {
                Err(ParseError::MalformedStream(format!(
                    "linha excede {} bytes",
                    MAX_LINE_BYTES
                )))?;
            }

            let trimmed = line.trim();

            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with("#EXTM3U") {
                found_header = true;
                continue;
            }

            if trimmed.starts_with('#') && !trimmed.starts_with("#EXTINF:") {
                continue;
            }

            if trimmed.starts_with("#EXTINF:") {
                current_extinf = parse_extinf(trimmed);
                continue;
            }

            if let Some(extinf) = current_extinf.take() {
                if trimmed.starts_with("http") {
                    let item = build_item(extinf, trimmed.to_string(), ordinal, normalize);
                    ordinal += 1;
                    yield item;
                }
            }
        }

        if !found_header {
            tracing::warn!("playlist sem cabeçalho #EXTM3U");
        }
    })
}

/// An open playlist source: content length (when the origin sends one) and
/// the entry stream.
pub struct M3uStream {
    pub content_length: Option<u64>,
    pub entries: EntryStream,
}

/// HTTP source for M3U playlists: bounded retry, size guard, streaming body
pub struct M3uSource {
    client: Client,
    max_retries: u32,
    max_size_mb: usize,
}

impl M3uSource {
    pub fn new(user_agent: &str, timeout_ms: u64, max_retries: u32, max_size_mb: usize) -> Self {
        let client = Client::builder()
            .user_agent(user_agent)
            // Whole-body ceiling: connect through the last byte
            .timeout(Duration::from_millis(timeout_ms))
            .gzip(true)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            max_retries,
            max_size_mb,
        }
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<Response, ParseError> {
        let mut last_err: Option<reqwest::Error> = None;

        for attempt in 0..=self.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    if resp.status().is_success() {
                        if let Some(len) = resp.content_length() {
                            let max_bytes = (self.max_size_mb as u64) * 1024 * 1024;
                            if len > max_bytes {
                                return Err(ParseError::SourceTooLarge {
                                    size_mb: len as f64 / 1024.0 / 1024.0,
                                    limit_mb: self.max_size_mb,
                                });
                            }
                        }
                        return Ok(resp);
                    }

                    let status = resp.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                        && attempt < self.max_retries
                    {
                        let backoff_ms = (1u64 << attempt).saturating_mul(500).min(10_000);
                        tracing::warn!(attempt = attempt + 1, reason = "429", backoff_ms);
                        sleep(Duration::from_millis(backoff_ms)).await;
                        continue;
                    }

                    let message = match status {
                        reqwest::StatusCode::NOT_FOUND => {
                            "Playlist não encontrada (404). Verifique a URL.".to_string()
                        }
                        reqwest::StatusCode::FORBIDDEN => {
                            "Acesso negado (403). A playlist pode exigir autenticação.".to_string()
                        }
                        reqwest::StatusCode::TOO_MANY_REQUESTS => {
                            "Muitas requisições (429). O servidor do M3U está limitando acessos."
                                .to_string()
                        }
                        _ => {
                            let reason = status
                                .canonical_reason()
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| "Erro".to_string());
                            format!("HTTP {}: {}", status.as_u16(), reason)
                        }
                    };

                    return Err(ParseError::HttpStatus {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(err) => {
                    if attempt < self.max_retries {
                        let backoff_ms = (1u64 << attempt).saturating_mul(500).min(10_000);
                        tracing::warn!(attempt = attempt + 1, reason = "network", backoff_ms);
                        last_err = Some(err);
                        sleep(Duration::from_millis(backoff_ms)).await;
                        continue;
                    }
                    return Err(map_reqwest_error(err));
                }
            }
        }

        Err(last_err
            .map(map_reqwest_error)
            .unwrap_or_else(|| ParseError::Network("erro desconhecido".to_string())))
    }

    /// Open a playlist URL as a lazy entry stream.
    /// The stream is finite, non-restartable, and yields in source order.
    pub async fn open(&self, url: &str, normalize: bool) -> Result<M3uStream, ParseError> {
        let response = self.fetch_with_retry(url).await?;
        let content_length = response.content_length();

        if let Some(len) = content_length {
            tracing::info!("playlist size: {:.2} MB", len as f64 / 1024.0 / 1024.0);
        }

        let bytes_stream = response.bytes_stream().map(|result| {
            result.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        });
        let reader = BufReader::new(StreamReader::new(bytes_stream));

        Ok(M3uStream {
            content_length,
            entries: entry_stream_from_reader(reader, normalize),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ParseError {
    if err.is_timeout() {
        ParseError::Timeout
    } else {
        ParseError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream_from_str(content: &str) -> EntryStream {
        let reader = BufReader::new(Cursor::new(content.as_bytes().to_vec()));
        entry_stream_from_reader(reader, true)
    }

    async fn collect_items(content: &str) -> Vec<PlaylistItem> {
        let mut stream = stream_from_str(content);
        let mut items = Vec::new();
        while let Some(entry) = stream.next().await {
            items.push(entry.expect("stream error"));
        }
        items
    }

    #[test]
    fn test_hash_url() {
        let hash = hash_url("http://example.com/playlist.m3u");
        assert_eq!(hash.len(), 40);
        // Query-param order changes the hash
        assert_ne!(hash_url("http://x/?a=1&b=2"), hash_url("http://x/?b=2&a=1"));
    }

    #[test]
    fn test_generate_item_id() {
        let id1 = generate_item_id(None, None, "http://stream1.com", 0);
        let id2 = generate_item_id(None, None, "http://stream2.com", 0);
        assert_ne!(id1, id2);
        assert!(id1.ends_with("_0"));
        assert_eq!(id1.len(), 12 + 2);
    }

    #[test]
    fn test_parse_extinf() {
        let line = r#"#EXTINF:-1 tvg-id="globo" tvg-name="Globo HD" tvg-logo="http://logo.com/globo.png" group-title="TV",Globo HD"#;
        let extinf = parse_extinf(line).unwrap();

        assert_eq!(extinf.title, "Globo HD");
        assert_eq!(extinf._duration, -1);
        assert_eq!(extinf.attributes.get("tvg-id"), Some(&"globo".to_string()));
        assert_eq!(extinf.attributes.get("group-title"), Some(&"TV".to_string()));
    }

    #[test]
    fn test_parse_extinf_minimal() {
        let line = "#EXTINF:-1,Canal Teste";
        let extinf = parse_extinf(line).unwrap();

        assert_eq!(extinf.title, "Canal Teste");
        assert!(extinf.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_stream_yields_in_source_order() {
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"Canais\",Globo HD\n\
            http://srv/live/1\n\
            #EXTINF:-1 group-title=\"Canais\",SBT HD\n\
            http://srv/live/2\n";
        let items = collect_items(playlist).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "Globo HD");
        assert_eq!(items[1].name, "SBT HD");
        assert_eq!(items[0].media_kind, MediaKind::Live);
    }

    #[tokio::test]
    async fn test_missing_trailing_newline_still_emits() {
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"Filmes\",Matrix (1999) Dublado\n\
            http://srv/movie/1";
        let items = collect_items(playlist).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].media_kind, MediaKind::Movie);
    }

    #[tokio::test]
    async fn test_missing_header_is_not_fatal() {
        let playlist = "#EXTINF:-1 group-title=\"Canais\",Globo HD\nhttp://srv/live/1\n";
        let items = collect_items(playlist).await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_playlist() {
        let items = collect_items("#EXTM3U\n").await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_other_directives_ignored() {
        let playlist = "#EXTM3U\n\
            #EXTVLCOPT:network-caching=1000\n\
            #EXTINF:-1 tvg-id=\"g1\" xui-id=\"77\" group-title=\"Canais\",Globo HD\n\
            http://srv/live/1\n";
        let items = collect_items(playlist).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].epg_id.as_deref(), Some("g1"));
        assert_eq!(items[0].xui_id.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn test_series_entry_carries_key_and_numbers() {
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"S • AMC\",Breaking Bad S01E02\n\
            http://srv/series/9\n";
        let items = collect_items(playlist).await;
        assert_eq!(items[0].media_kind, MediaKind::Series);
        assert!(items[0].series_key.is_some());
        assert_eq!(items[0].season_number, Some(1));
        assert_eq!(items[0].episode_number, Some(2));
        assert_eq!(items[0].parsed_title.season, Some(1));
        assert_eq!(items[0].parsed_title.episode, Some(2));
    }

    #[tokio::test]
    async fn test_normalization_collapses_spaces() {
        let playlist = "#EXTM3U\n\
            #EXTINF:-1 group-title=\"Canais   Abertos\",Globo    HD\n\
            http://srv/live/1\n";
        let items = collect_items(playlist).await;
        assert_eq!(items[0].name, "Globo HD");
        assert_eq!(items[0].group, "Canais Abertos");
    }

    #[tokio::test]
    async fn test_url_without_extinf_is_skipped() {
        let playlist = "#EXTM3U\nhttp://srv/orphan\n";
        let items = collect_items(playlist).await;
        assert!(items.is_empty());
    }
}
