use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::models::{ExtractedSeriesInfo, MediaKind, ParsedTitle};

/// Bounded memoization for the classification cascade. Large playlists repeat
/// the same (name, group) pairs across re-parses; the cascade runs a dozen
/// regexes per miss.
const CLASSIFY_CACHE_SIZE: usize = 50_000;
const SERIES_CACHE_SIZE: usize = 10_000;
const GROUP_CACHE_SIZE: usize = 4_096;

lazy_static! {
    static ref CLASSIFY_CACHE: Mutex<LruCache<String, Option<MediaKind>>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(CLASSIFY_CACHE_SIZE).unwrap()));
    static ref GROUP_FALLBACK_CACHE: Mutex<LruCache<String, Option<MediaKind>>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(GROUP_CACHE_SIZE).unwrap()));
    static ref SERIES_CACHE: Mutex<LruCache<String, Option<ExtractedSeriesInfo>>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(SERIES_CACHE_SIZE).unwrap()));

    // ============ GROUP PREFIX RULES ============
    static ref GROUP_STAR_PREFIX: Regex = Regex::new(r"^⭐").unwrap();
    static ref GROUP_SERIES_PREFIX: Regex =
        Regex::new(r"(?i)^(S\s*•|S[eé]ries\s*\|)").unwrap();
    static ref GROUP_NOVELAS: Regex = Regex::new(r"(?i)^novelas$").unwrap();
    static ref GROUP_MOVIE_PREFIX: Regex =
        Regex::new(r"(?i)^(F\s*•|Filmes\s*\|)").unwrap();

    // ============ NAME PREFIX RULES ============
    static ref CANAL_24H_PREFIX: Regex = Regex::new(r"(?i)^24H\s*•").unwrap();
    static ref CINE_TEMATICO: Regex = Regex::new(r"(?i)^CINE\s+\w+\s+\d{2}").unwrap();
    static ref EVENTO_HORARIO: Regex = Regex::new(r"^\d{1,2}:\d{2}\s+").unwrap();

    // ============ SPECIAL PATTERNS ============
    static ref COLETANEA: Regex = Regex::new(r"(?i)colet[aâ]nea").unwrap();
    static ref SERIES_PATTERN_CHECK: Regex = Regex::new(r"(?i)S\d{1,2}\s*E\d{1,3}").unwrap();

    // ============ TITLE PATTERNS ============
    static ref TITLE_SERIES_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)s\d{1,2}[\s._-]?e\d{1,3}").unwrap(),
        Regex::new(r"(?i)\b\d{1,2}x\d{1,3}\b").unwrap(),
        Regex::new(r"(?i)\bT\d{1,2}[\s._-]?E\d{1,3}\b").unwrap(),
        Regex::new(r"(?i)\btemporada\s*\d+").unwrap(),
        Regex::new(r"(?i)\bepis[oó]dio\s*\d+").unwrap(),
        Regex::new(r"(?i)\bcap[ií]tulo\s*\d+").unwrap(),
    ];
    static ref CHANNEL_SUFFIX: Regex =
        Regex::new(r"(?i)\b(FHD|HD|SD)\s*$|\[ALT\]\s*$").unwrap();
    static ref TITLE_YEAR: Regex = Regex::new(r"[\(\[]\d{4}[\)\]]").unwrap();
    static ref TITLE_MOVIE_TOKENS: Regex = Regex::new(
        r"(?i)\b(4k|2160p|1080p|720p|480p|bluray|webrip|hdrip|dvdrip|web-dl|bdrip|dub|dublado|leg|legendado|nacional|dual)\b"
    )
    .unwrap();

    // ============ GROUP KEYWORD FALLBACK ============
    static ref FALLBACK_SERIES: Regex =
        Regex::new(r"(?i)\b(s[eé]ries?|novelas?|doramas?|animes?)\b").unwrap();
    static ref FALLBACK_MOVIE: Regex = Regex::new(
        r"(?i)\b(filmes?|movies?|cinema|vod|lan[cç]amentos?|a[cç][aã]o|terror|com[eé]dia|drama|suspense|romance|aventura|anima[cç][aã]o|fic[cç][aã]o)\b"
    )
    .unwrap();
    static ref FALLBACK_LIVE: Regex = Regex::new(
        r"(?i)\b(esportes?|sports?|news|not[ií]cias|canais?|channels?|ao vivo|tv|24h(rs)?|ppv|document[aá]rios?)\b|24/7"
    )
    .unwrap();

    // ============ TITLE EXTRACTORS ============
    static ref EXTRACTOR_YEAR: Regex = Regex::new(r"[\(\[](\d{4})[\)\]]").unwrap();
    static ref EXTRACTOR_YEAR_STANDALONE: Regex = Regex::new(r"\b(19|20)\d{2}\b").unwrap();
    static ref EXTRACTOR_SEASON_EPISODE: Regex =
        Regex::new(r"(?i)s(\d{1,2})[\s._-]?e(\d{1,3})").unwrap();
    static ref EXTRACTOR_ALT_SEASON_EPISODE: Regex =
        Regex::new(r"\b(\d{1,2})x(\d{1,3})\b").unwrap();
    static ref EXTRACTOR_PT_SEASON_EPISODE: Regex =
        Regex::new(r"(?i)\bT(\d{1,2})[\s._-]?E(\d{1,3})\b").unwrap();
    static ref EXTRACTOR_SEASON: Regex =
        Regex::new(r"(?i)(?:season|temporada)[\s._-]?(\d{1,2})").unwrap();
    static ref EXTRACTOR_EPISODE: Regex =
        Regex::new(r"(?i)(?:episode|epis[oó]dio|cap[ií]tulo)[\s._-]?(\d{1,3})").unwrap();
    static ref EXTRACTOR_QUALITY: Regex =
        Regex::new(r"(?i)\b(4k|2160p|1080p|720p|480p|360p|hd|fhd|uhd|sd)\b").unwrap();
    static ref EXTRACTOR_MULTI_AUDIO: Regex =
        Regex::new(r"(?i)\b(dual|multi|dublado\s*e\s*legendado)\b").unwrap();
    static ref EXTRACTOR_DUBBED: Regex =
        Regex::new(r"(?i)\b(dub|dublado|dubbed|nacional)\b").unwrap();
    static ref EXTRACTOR_SUBBED: Regex =
        Regex::new(r"(?i)\b(leg|legendado|subbed|sub)\b").unwrap();
    static ref EXTRACTOR_LANGUAGE: Regex =
        Regex::new(r"(?i)\b(ptbr|pt-br|por|eng|esp|fra|deu|ita|jpn)\b").unwrap();

    // ============ SERIES INFO PATTERNS ============
    static ref SERIES_MAIN_PATTERN: Regex =
        Regex::new(r"(?i)(.+?)\s+S(\d{1,2})[\s._-]?E(\d{1,3})").unwrap();
    static ref SERIES_ALT_PATTERN: Regex =
        Regex::new(r"(?i)(.+?)\s+(\d{1,2})x(\d{1,3})\b").unwrap();
    static ref SERIES_PT_PATTERN: Regex =
        Regex::new(r"(?i)(.+?)\s+T(\d{1,2})[\s._-]?E(\d{1,3})").unwrap();
    static ref SERIES_WORDS_PATTERN: Regex = Regex::new(
        r"(?i)(.+?)\s+temporada\s*(\d{1,2}).*?(?:epis[oó]dio|cap[ií]tulo)\s*(\d{1,3})"
    )
    .unwrap();

    static ref PREFIX_CLEANER: Regex =
        Regex::new(r"^(\[.*?\]|\(.*?\)|⭐|★|•|\+|\-|=|#)\s*").unwrap();
    static ref NUMBERING_CLEANER: Regex = Regex::new(r"^\d+\.\s+").unwrap();
}

/// Canonical content classifier for playlist entries.
///
/// Pure and deterministic over (name, group, url); never panics, never
/// errors. `Unknown` is the terminal fallback. Client implementations must
/// reproduce this cascade exactly.
pub struct ContentClassifier;

impl ContentClassifier {
    /// Classification cascade, first match wins:
    /// group prefixes, name prefixes, the COLETÂNEA exception, name
    /// patterns, then the URL path hint, then group keyword fallback.
    pub fn classify(name: &str, group: &str, url: &str) -> MediaKind {
        if let Some(kind) = Self::classify_pre(name, group) {
            return kind;
        }
        if let Some(kind) = Self::url_path_hint(url) {
            return kind;
        }
        if let Some(kind) = Self::classify_group_fallback(group) {
            return kind;
        }
        MediaKind::Unknown
    }

    /// Stages before the URL hint, memoized per (name, group).
    fn classify_pre(name: &str, group: &str) -> Option<MediaKind> {
        let cache_key = format!("{}\u{1f}{}", name, group);
        {
            let mut cache = CLASSIFY_CACHE.lock().unwrap();
            if let Some(cached) = cache.get(&cache_key) {
                return *cached;
            }
        }

        let result = Self::classify_pre_uncached(name, group);

        let mut cache = CLASSIFY_CACHE.lock().unwrap();
        cache.put(cache_key, result);
        result
    }

    fn classify_pre_uncached(name: &str, group: &str) -> Option<MediaKind> {
        // 1. Group prefixes, the strongest IPTV convention signal.
        // "⭐ SERIES 24H" is a 24/7 loop, not a series.
        if !group.is_empty() {
            if GROUP_STAR_PREFIX.is_match(group) {
                return Some(MediaKind::Live);
            }
            if GROUP_SERIES_PREFIX.is_match(group) || GROUP_NOVELAS.is_match(group) {
                return Some(MediaKind::Series);
            }
            if GROUP_MOVIE_PREFIX.is_match(group) {
                return Some(MediaKind::Movie);
            }
        }

        // 2. Name prefixes: 24H loops, thematic CINE channels
        // (CINE TERROR 01), scheduled events (19:30 Juventude x Bahia).
        if !name.is_empty() {
            if CANAL_24H_PREFIX.is_match(name)
                || CINE_TEMATICO.is_match(name)
                || EVENTO_HORARIO.is_match(name)
            {
                return Some(MediaKind::Live);
            }
        }

        // 3. Franchise collections use episode notation for bundled films
        // (Harry Potter S01E01 inside a COLETÂNEA group is a movie).
        if !group.is_empty() && COLETANEA.is_match(group) && SERIES_PATTERN_CHECK.is_match(name) {
            return Some(MediaKind::Movie);
        }

        // 4. Name patterns. Series notation first, then channel quality
        // suffixes (Globo FHD), then year+token movie scoring.
        for pattern in TITLE_SERIES_PATTERNS.iter() {
            if pattern.is_match(name) {
                return Some(MediaKind::Series);
            }
        }
        if CHANNEL_SUFFIX.is_match(name) {
            return Some(MediaKind::Live);
        }
        if TITLE_YEAR.is_match(name) && TITLE_MOVIE_TOKENS.is_match(name) {
            return Some(MediaKind::Movie);
        }

        None
    }

    /// Stream-URL path hint. Overrides the keyword fallback but nothing
    /// above it.
    pub fn url_path_hint(url: &str) -> Option<MediaKind> {
        let lower = url.to_lowercase();
        if lower.contains("/series/") {
            return Some(MediaKind::Series);
        }
        if lower.contains("/movie/") {
            return Some(MediaKind::Movie);
        }
        if lower.contains("/live/") || lower.contains("/stream/") || lower.contains("/channel/") {
            return Some(MediaKind::Live);
        }
        None
    }

    /// Weakest signal: keyword sweep over the group name. Series before
    /// movies before live, so "Filmes | Apple TV" does not land in live.
    fn classify_group_fallback(group: &str) -> Option<MediaKind> {
        if group.is_empty() {
            return None;
        }

        {
            let mut cache = GROUP_FALLBACK_CACHE.lock().unwrap();
            if let Some(cached) = cache.get(group) {
                return *cached;
            }
        }

        let result = if FALLBACK_SERIES.is_match(group) {
            Some(MediaKind::Series)
        } else if FALLBACK_MOVIE.is_match(group) {
            Some(MediaKind::Movie)
        } else if FALLBACK_LIVE.is_match(group) {
            Some(MediaKind::Live)
        } else {
            None
        };

        let mut cache = GROUP_FALLBACK_CACHE.lock().unwrap();
        cache.put(group.to_string(), result);
        result
    }

    /// Extract metadata from a display title
    pub fn parse_title(name: &str) -> ParsedTitle {
        let mut title = name.to_string();
        let mut year: Option<u16> = None;
        let mut season: Option<u8> = None;
        let mut episode: Option<u16> = None;
        let mut quality: Option<String> = None;
        let mut language: Option<String> = None;

        let current_year: u16 = chrono::Utc::now()
            .format("%Y")
            .to_string()
            .parse()
            .unwrap_or(2025);

        // Year: bracketed form preferred, bare year validated
        if let Some(caps) = EXTRACTOR_YEAR.captures(name) {
            if let Some(y) = caps.get(1) {
                let parsed: u16 = y.as_str().parse().unwrap_or(0);
                if (1900..=current_year + 1).contains(&parsed) {
                    year = Some(parsed);
                }
                title = title.replace(caps.get(0).unwrap().as_str(), "");
            }
        } else if let Some(m) = EXTRACTOR_YEAR_STANDALONE.find(name) {
            let parsed: u16 = m.as_str().parse().unwrap_or(0);
            if (1900..=current_year + 1).contains(&parsed) {
                year = Some(parsed);
            }
        }

        // Season and episode: S01E01, then 1x01, then T01E01, then words
        if let Some(caps) = EXTRACTOR_SEASON_EPISODE.captures(name) {
            season = caps.get(1).and_then(|m| m.as_str().parse().ok());
            episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
            title = title.replace(caps.get(0).unwrap().as_str(), "");
        } else if let Some(caps) = EXTRACTOR_ALT_SEASON_EPISODE.captures(name) {
            season = caps.get(1).and_then(|m| m.as_str().parse().ok());
            episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
            title = title.replace(caps.get(0).unwrap().as_str(), "");
        } else if let Some(caps) = EXTRACTOR_PT_SEASON_EPISODE.captures(name) {
            season = caps.get(1).and_then(|m| m.as_str().parse().ok());
            episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
            title = title.replace(caps.get(0).unwrap().as_str(), "");
        } else {
            if let Some(caps) = EXTRACTOR_SEASON.captures(name) {
                season = caps.get(1).and_then(|m| m.as_str().parse().ok());
            }
            if let Some(caps) = EXTRACTOR_EPISODE.captures(name) {
                episode = caps.get(1).and_then(|m| m.as_str().parse().ok());
            }
        }

        // Quality
        if let Some(caps) = EXTRACTOR_QUALITY.captures(name) {
            quality = caps.get(1).map(|m| m.as_str().to_uppercase());
            title = title.replace(caps.get(0).unwrap().as_str(), "");
        }

        // Audio flags
        let is_multi_audio = EXTRACTOR_MULTI_AUDIO.is_match(name);
        let is_dubbed = EXTRACTOR_DUBBED.is_match(name);
        let is_subbed = EXTRACTOR_SUBBED.is_match(name);

        // Language
        if let Some(caps) = EXTRACTOR_LANGUAGE.captures(name) {
            language = caps.get(1).map(|m| m.as_str().to_uppercase());
        }

        let title = Self::clean_title(&title);
        let title_normalized = title.to_uppercase();

        ParsedTitle {
            title,
            title_normalized,
            year,
            season,
            episode,
            quality,
            language,
            is_multi_audio,
            is_dubbed,
            is_subbed,
        }
    }

    /// Remove common prefixes (tags, emojis, list numbering) from a title
    fn remove_prefixes(title: &str) -> String {
        let result = PREFIX_CLEANER.replace_all(title, "");
        let result = NUMBERING_CLEANER.replace_all(&result, "");
        result.trim().to_string()
    }

    /// Extract series info from a name (SxxExx, 1x01, T01E01, season words).
    /// Returns None when no season+episode pattern is present.
    pub fn extract_series_info(name: &str) -> Option<ExtractedSeriesInfo> {
        {
            let mut cache = SERIES_CACHE.lock().unwrap();
            if let Some(cached) = cache.get(name) {
                return cached.clone();
            }
        }

        let clean_name = Self::remove_prefixes(name);
        let result = [
            &*SERIES_MAIN_PATTERN,
            &*SERIES_PT_PATTERN,
            &*SERIES_ALT_PATTERN,
            &*SERIES_WORDS_PATTERN,
        ]
        .iter()
        .find_map(|pattern| {
            pattern.captures(&clean_name).and_then(|caps| {
                let series_name = caps.get(1)?.as_str().trim().to_string();
                let season = caps.get(2)?.as_str().parse().ok()?;
                let episode = caps.get(3)?.as_str().parse().ok()?;
                Some(ExtractedSeriesInfo {
                    series_name,
                    season,
                    episode,
                })
            })
        });

        let mut cache = SERIES_CACHE.lock().unwrap();
        cache.put(name.to_string(), result.clone());
        result
    }

    /// Clean a title, removing tags, quality and audio markers
    pub fn clean_title(title: &str) -> String {
        lazy_static! {
            static ref BRACKETS: Regex = Regex::new(r"[\[\(][^\]\)]*[\]\)]").unwrap();
            static ref QUALITY: Regex =
                Regex::new(r"(?i)\b(4k|2160p|1080p|720p|480p|360p|hd|fhd|uhd|sd)\b").unwrap();
            static ref FORMATS: Regex = Regex::new(
                r"(?i)\b(aac|ac3|dts|x264|x265|hevc|h264|h265|webdl|web-dl|bluray|bdrip|webrip|hdrip|dvdrip|hdcam)\b"
            )
            .unwrap();
            static ref AUDIO: Regex = Regex::new(
                r"(?i)\b(dub|dublado|dubbed|leg|legendado|subbed|sub|dual|multi|nacional)\b"
            )
            .unwrap();
            static ref PIPES: Regex = Regex::new(r"[|]").unwrap();
            static ref MULTI_SPACES: Regex = Regex::new(r"\s+").unwrap();
            static ref TRAILING_PUNCT: Regex = Regex::new(r"[.\-_]+$").unwrap();
        }

        let result = BRACKETS.replace_all(title, "");
        let result = QUALITY.replace_all(&result, "");
        let result = FORMATS.replace_all(&result, "");
        let result = AUDIO.replace_all(&result, "");
        let result = PIPES.replace_all(&result, " ");
        let result = MULTI_SPACES.replace_all(&result, " ");
        let result = result.trim();
        let result = TRAILING_PUNCT.replace_all(result, "");
        result.trim().to_string()
    }

    /// Clear memoization caches (tests)
    #[cfg(test)]
    pub fn clear_caches() {
        CLASSIFY_CACHE.lock().unwrap().clear();
        GROUP_FALLBACK_CACHE.lock().unwrap().clear();
        SERIES_CACHE.lock().unwrap().clear();
    }
}
