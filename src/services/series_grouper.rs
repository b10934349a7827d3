use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

use crate::models::{SeriesInfo, SeriesStats};
use crate::services::m3u_parser::short_hash;

lazy_static! {
    static ref BRACKET_TAGS: Regex = Regex::new(r"\[[^\]]*\]|\([^)]*\)").unwrap();
    static ref LANG_SUFFIX: Regex = Regex::new(r"(?i)\b(pt-br|pt|br|eng|esp)\s*$").unwrap();
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

/// Normalize a series name for keying and fuzzy comparison: lowercase,
/// bracketed tags and trailing language markers stripped, non-alphanumerics
/// collapsed to single spaces.
pub fn normalize_series_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let stripped = BRACKET_TAGS.replace_all(&lower, " ");
    let stripped = LANG_SUFFIX.replace_all(&stripped, " ");
    let collapsed = NON_ALNUM.replace_all(&stripped, " ");
    collapsed.trim().to_string()
}

/// Deterministic series key from the normalized name, group and year
pub fn make_series_key(series_name: &str, group: &str, year: Option<u16>) -> String {
    let normalized = normalize_series_name(series_name);
    let basis = match year {
        Some(y) => format!("{}|{}|{}", normalized, group, y),
        None => format!("{}|{}", normalized, group),
    };
    short_hash(&basis)
}

/// One episode inside an open run
#[derive(Debug, Clone)]
pub struct RunEpisode {
    pub item_id: String,
    pub season: u8,
    pub episode: u16,
}

/// Open run of contiguous episodes sharing a series key.
/// Only the current run is held in memory while streaming.
#[derive(Debug)]
pub struct SeriesRun {
    pub series_key: String,
    pub series_name: String,
    pub group: String,
    pub logo: Option<String>,
    pub year: Option<u16>,
    pub quality: Option<String>,
    pub episodes: Vec<RunEpisode>,
}

impl SeriesRun {
    pub fn push(&mut self, episode: RunEpisode) {
        self.episodes.push(episode);
    }
}

/// Series aggregate under construction
#[derive(Debug)]
pub struct SeriesBuilder {
    pub id: String,
    pub name: String,
    pub name_normalized: String,
    pub group: String,
    pub logo: Option<String>,
    pub year: Option<u16>,
    pub quality: Option<String>,
    pub total_episodes: usize,
    pub seasons: BTreeSet<u16>,
    pub first_episode: u16,
    pub last_episode: u16,
    /// Item id of the only episode, kept while the series is a singleton so
    /// a fuzzy merge can remap it in the store
    pub sole_item_id: Option<String>,
}

impl SeriesBuilder {
    fn from_run(playlist_hash: &str, run: &SeriesRun) -> Self {
        Self {
            id: format!("{}_{}", playlist_hash, run.series_key),
            name: run.series_name.clone(),
            name_normalized: normalize_series_name(&run.series_name),
            group: run.group.clone(),
            logo: run.logo.clone(),
            year: run.year,
            quality: run.quality.clone(),
            total_episodes: 0,
            seasons: BTreeSet::new(),
            first_episode: u16::MAX,
            last_episode: 0,
            sole_item_id: None,
        }
    }

    fn absorb(&mut self, episodes: &[RunEpisode]) {
        for ep in episodes {
            self.total_episodes += 1;
            self.seasons.insert(u16::from(ep.season));
            self.first_episode = self.first_episode.min(ep.episode);
            self.last_episode = self.last_episode.max(ep.episode);
        }
        self.sole_item_id = if self.total_episodes == 1 {
            episodes.first().map(|ep| ep.item_id.clone())
        } else {
            None
        };
    }

    pub fn build(self) -> SeriesInfo {
        let first_season = self.seasons.iter().next().copied().unwrap_or(0);
        let last_season = self.seasons.iter().next_back().copied().unwrap_or(0);
        SeriesInfo {
            id: self.id,
            name: self.name,
            logo: self.logo,
            group: self.group,
            total_episodes: self.total_episodes,
            total_seasons: self.seasons.len(),
            first_season,
            last_season,
            first_episode: if self.first_episode == u16::MAX {
                0
            } else {
                self.first_episode
            },
            last_episode: self.last_episode,
            year: self.year,
            quality: self.quality,
        }
    }
}

/// All series aggregates for one playlist. Closed runs land here with one
/// map lookup and one update per run, never per episode.
#[derive(Debug)]
pub struct SeriesAccumulator {
    playlist_hash: String,
    builders: HashMap<String, SeriesBuilder>,
    total_episodes: usize,
}

impl SeriesAccumulator {
    pub fn new(playlist_hash: &str) -> Self {
        Self {
            playlist_hash: playlist_hash.to_string(),
            builders: HashMap::new(),
            total_episodes: 0,
        }
    }

    /// Close a run: create or extend the aggregate for its key
    pub fn flush_run(&mut self, run: SeriesRun) {
        if run.episodes.is_empty() {
            return;
        }
        self.total_episodes += run.episodes.len();
        let builder = self
            .builders
            .entry(run.series_key.clone())
            .or_insert_with(|| SeriesBuilder::from_run(&self.playlist_hash, &run));
        if builder.logo.is_none() {
            builder.logo = run.logo.clone();
        }
        let had_episodes = builder.total_episodes;
        builder.absorb(&run.episodes);
        // A second run for the same key ends singleton status
        if had_episodes > 0 {
            builder.sole_item_id = None;
        }
    }

    pub fn series_id_for(&self, key: &str) -> String {
        format!("{}_{}", self.playlist_hash, key)
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    pub fn stats(&self) -> SeriesStats {
        SeriesStats::from_counts(self.builders.len(), self.total_episodes)
    }

    /// Consume the accumulator into the final series table, sorted by name
    /// then id so completed metadata is deterministic.
    pub fn into_series(self) -> Vec<SeriesInfo> {
        let mut series: Vec<SeriesInfo> = self
            .builders
            .into_values()
            .map(SeriesBuilder::build)
            .collect();
        series.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        series
    }
}

/// Fuzzy-merge tuning
#[derive(Debug, Clone)]
pub struct FuzzyConfig {
    pub similarity_threshold: f64,
    pub max_comparisons_per_singleton: usize,
    pub max_singletons: usize,
}

/// Result of the singleton merge pass
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub merged: usize,
    pub skipped: bool,
    /// item_id -> new series_id, applied to stored items afterwards
    pub remaps: HashMap<String, String>,
}

fn word_prefix(word: &str) -> String {
    word.chars().take(3).collect()
}

/// Two-row Levenshtein distance over chars, O(min(|a|,|b|)) space
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    // Keep the shorter string in the row
    let (long, short) = if a.len() >= b.len() { (&a, &b) } else { (&b, &a) };

    if short.is_empty() {
        return long.len();
    }

    let mut prev: Vec<usize> = (0..=short.len()).collect();
    let mut curr: Vec<usize> = vec![0; short.len() + 1];

    for (i, lc) in long.iter().enumerate() {
        curr[0] = i + 1;
        for (j, sc) in short.iter().enumerate() {
            let cost = usize::from(lc != sc);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[short.len()]
}

/// Normalized similarity in [0, 1]
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

/// Merge singleton series into multi-episode anchors by fuzzy name match.
///
/// Anchors are bucketed by the first word of the normalized name, which
/// prunes most of the candidate space; each singleton compares against at
/// most `max_comparisons_per_singleton` anchors and merges when the best
/// similarity clears the threshold. Above `max_singletons` the pass is
/// skipped entirely.
pub fn fuzzy_merge(accum: &mut SeriesAccumulator, cfg: &FuzzyConfig) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    let singleton_keys: Vec<String> = accum
        .builders
        .iter()
        .filter(|(_, b)| b.total_episodes == 1)
        .map(|(k, _)| k.clone())
        .collect();

    if singleton_keys.is_empty() {
        return outcome;
    }

    if singleton_keys.len() > cfg.max_singletons {
        tracing::warn!(
            singletons = singleton_keys.len(),
            cap = cfg.max_singletons,
            "fuzzy merge skipped, too many singleton series"
        );
        outcome.skipped = true;
        return outcome;
    }

    // first word of normalized name -> anchor keys (with names for
    // scoring); a second index on the word's 3-char prefix catches typos
    // inside the first word itself (Broklyn vs Brooklyn)
    let mut word_index: HashMap<String, Vec<(String, String)>> = HashMap::new();
    let mut prefix_index: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for (key, builder) in accum
        .builders
        .iter()
        .filter(|(_, b)| b.total_episodes >= 2)
    {
        if let Some(first_word) = builder.name_normalized.split_whitespace().next() {
            let entry = (key.clone(), builder.name_normalized.clone());
            word_index
                .entry(first_word.to_string())
                .or_default()
                .push(entry.clone());
            prefix_index
                .entry(word_prefix(first_word))
                .or_default()
                .push(entry);
        }
    }

    for singleton_key in singleton_keys {
        let (singleton_name, first_word) = {
            let builder = match accum.builders.get(&singleton_key) {
                Some(b) => b,
                None => continue,
            };
            let first_word = match builder.name_normalized.split_whitespace().next() {
                Some(w) => w.to_string(),
                None => continue,
            };
            (builder.name_normalized.clone(), first_word)
        };

        let candidates = match word_index
            .get(&first_word)
            .or_else(|| prefix_index.get(&word_prefix(&first_word)))
        {
            Some(c) => c,
            None => continue,
        };

        let mut best: Option<(&str, f64)> = None;
        for (anchor_key, anchor_name) in
            candidates.iter().take(cfg.max_comparisons_per_singleton)
        {
            let score = similarity(&singleton_name, anchor_name);
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((anchor_key.as_str(), score));
            }
        }

        if let Some((anchor_key, score)) = best {
            if score >= cfg.similarity_threshold {
                let anchor_key = anchor_key.to_string();
                let singleton = accum.builders.remove(&singleton_key).unwrap();
                let anchor = accum
                    .builders
                    .get_mut(&anchor_key)
                    .expect("anchor key from index");

                anchor.total_episodes += singleton.total_episodes;
                anchor.seasons.extend(singleton.seasons.iter().copied());
                anchor.first_episode = anchor.first_episode.min(singleton.first_episode);
                anchor.last_episode = anchor.last_episode.max(singleton.last_episode);

                if let Some(item_id) = singleton.sole_item_id {
                    outcome.remaps.insert(item_id, anchor.id.clone());
                }
                outcome.merged += 1;
            }
        }
    }

    outcome
}
