//! Search-and-rank pipeline: keyword search, per-candidate enrichment,
//! freshness/engagement ranking and concurrent thumbnail resolution.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, info_span, warn, Instrument};
use trendscan_adapters::{FixtureProvider, VideoProvider, YtDlpConfig, YtDlpProvider};
use trendscan_core::{
    clamp_result_count, normalize_keywords, rank_records, Thumbnail, VideoRecord,
};
use trendscan_storage::{HttpClientConfig, HttpFetcher, ThumbnailFetcher, ThumbnailStore};

pub mod export;
pub mod pool;

pub use export::{ExportRow, TabularExporter, ThumbnailCell};
pub use pool::{run_thumbnail_pool, ThumbnailCompletion, ThumbnailJob, ThumbnailSource};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub static_root: PathBuf,
    pub thumbnail_dir: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub thumbnail_workers: usize,
    pub ytdlp_binary: PathBuf,
    pub provider_timeout_secs: u64,
    pub fixture_path: Option<PathBuf>,
    pub dedup_links: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            static_root: PathBuf::from("./static"),
            thumbnail_dir: "thumbnails".to_string(),
            http_timeout_secs: 10,
            user_agent: "trendscan/0.1".to_string(),
            thumbnail_workers: 10,
            ytdlp_binary: PathBuf::from("yt-dlp"),
            provider_timeout_secs: 60,
            fixture_path: None,
            dedup_links: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            static_root: std::env::var("TRENDSCAN_STATIC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_root),
            thumbnail_dir: std::env::var("TRENDSCAN_THUMBNAIL_DIR")
                .unwrap_or(defaults.thumbnail_dir),
            http_timeout_secs: env_parse("TRENDSCAN_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("TRENDSCAN_USER_AGENT").unwrap_or(defaults.user_agent),
            thumbnail_workers: env_parse("TRENDSCAN_THUMBNAIL_WORKERS")
                .unwrap_or(defaults.thumbnail_workers),
            ytdlp_binary: std::env::var("TRENDSCAN_YTDLP_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.ytdlp_binary),
            provider_timeout_secs: env_parse("TRENDSCAN_PROVIDER_TIMEOUT_SECS")
                .unwrap_or(defaults.provider_timeout_secs),
            fixture_path: std::env::var("TRENDSCAN_FIXTURE").ok().map(PathBuf::from),
            dedup_links: std::env::var("TRENDSCAN_DEDUP_LINKS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(defaults.dedup_links),
        }
    }

    /// The fixture provider when one is configured, otherwise yt-dlp.
    pub fn build_provider(&self) -> Result<Arc<dyn VideoProvider>> {
        match &self.fixture_path {
            Some(path) => {
                let provider = FixtureProvider::from_path(path)
                    .with_context(|| format!("loading fixture provider {}", path.display()))?;
                Ok(Arc::new(provider))
            }
            None => Ok(Arc::new(YtDlpProvider::new(YtDlpConfig {
                binary: self.ytdlp_binary.clone(),
                timeout: Duration::from_secs(self.provider_timeout_secs),
            }))),
        }
    }

    pub fn build_thumbnail_fetcher(&self) -> Result<ThumbnailFetcher> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })?;
        Ok(ThumbnailFetcher::new(
            http,
            ThumbnailStore::new(self.static_root.clone(), self.thumbnail_dir.clone()),
        ))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// OR-combine keywords as exact phrases: `"a" OR "b"`.
pub fn build_query(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|k| format!("\"{}\"", k.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Deterministic per-run file stem; the rank index keeps names unique.
pub fn thumbnail_file_stem(record: &VideoRecord, index: usize) -> String {
    format!("thumbnail_{}_{}", record.video_id(), index)
}

pub struct SearchPipeline {
    provider: Arc<dyn VideoProvider>,
    thumbnails: Arc<dyn ThumbnailSource>,
    static_root: PathBuf,
    workers: usize,
    dedup_links: bool,
}

impl SearchPipeline {
    pub fn new(
        provider: Arc<dyn VideoProvider>,
        thumbnails: Arc<dyn ThumbnailSource>,
        static_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            thumbnails,
            static_root: static_root.into(),
            workers: 10,
            dedup_links: true,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let provider = config.build_provider()?;
        let fetcher = config.build_thumbnail_fetcher()?;
        Ok(Self::new(provider, Arc::new(fetcher), config.static_root.clone())
            .with_workers(config.thumbnail_workers)
            .with_dedup_links(config.dedup_links))
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_dedup_links(mut self, dedup_links: bool) -> Self {
        self.dedup_links = dedup_links;
        self
    }

    pub fn static_root(&self) -> &Path {
        &self.static_root
    }

    /// Exporter resolving thumbnails against the same static root this pipeline writes to.
    pub fn exporter(&self) -> TabularExporter {
        TabularExporter::new(self.static_root.clone())
    }

    /// Run one search. Never fails: every error is logged and the result is
    /// simply shorter, or empty.
    pub async fn run<S: AsRef<str>>(&self, keywords: &[S], max_results: usize) -> Vec<VideoRecord> {
        let keywords = normalize_keywords(keywords);
        if keywords.is_empty() {
            warn!("search requested with no usable keywords");
            return Vec::new();
        }

        let count = clamp_result_count(max_results);
        let query = build_query(&keywords);
        let span = info_span!("search_pipeline", query = %query, count);
        self.run_query(&query, count).instrument(span).await
    }

    async fn run_query(&self, query: &str, count: usize) -> Vec<VideoRecord> {
        info!(provider = self.provider.name(), "searching");
        let candidates = match self.provider.search(query, count * 2).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(error = %err, "search request failed");
                return Vec::new();
            }
        };
        if candidates.is_empty() {
            info!("search returned no candidates");
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(count);
        for candidate in &candidates {
            if records.len() >= count {
                break;
            }
            let Some(link) = candidate
                .link
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty())
            else {
                warn!(title = candidate.display_title(), "search result missing link");
                continue;
            };
            if self.dedup_links && !seen.insert(link.to_string()) {
                debug!(url = link, "skipping repeated link");
                continue;
            }
            if let Some(record) = self.enrich(link).await {
                records.push(record);
            }
        }

        if records.is_empty() {
            info!(candidates = candidates.len(), "no candidate could be enriched");
            return Vec::new();
        }

        rank_records(&mut records);
        records.truncate(count);
        self.resolve_thumbnails(&mut records).await;
        info!(returned = records.len(), "search complete");
        records
    }

    /// Look up one video's metadata. Provider failures are logged and yield `None`.
    pub async fn enrich(&self, url: &str) -> Option<VideoRecord> {
        match self.provider.video_details(url).await {
            Ok(details) => Some(VideoRecord::from_details(url, details)),
            Err(err) => {
                warn!(url, error = %err, "could not fetch video details");
                None
            }
        }
    }

    /// Replace every record's remote thumbnail URL with a local reference or
    /// `Absent`. Record order is untouched.
    pub async fn resolve_thumbnails(&self, records: &mut [VideoRecord]) {
        let mut jobs = Vec::new();
        for (index, record) in records.iter_mut().enumerate() {
            if matches!(record.thumbnail, Thumbnail::Local(_)) {
                continue;
            }
            match record.thumbnail.usable_remote_url().map(str::to_string) {
                Some(url) => jobs.push(ThumbnailJob {
                    index,
                    url,
                    file_stem: thumbnail_file_stem(record, index),
                    title: record.title.clone(),
                }),
                None => {
                    warn!(title = %record.title, "no thumbnail URL to download");
                    record.thumbnail = Thumbnail::Absent;
                }
            }
        }

        let completions = run_thumbnail_pool(self.thumbnails.clone(), self.workers, jobs).await;
        for completion in completions {
            let Some(record) = records.get_mut(completion.index) else {
                continue;
            };
            match &completion.path {
                Some(path) => info!(title = %record.title, path = %path, "thumbnail processed"),
                None => warn!(title = %record.title, "thumbnail download failed"),
            }
            record.thumbnail = Thumbnail::from(completion.path);
        }

        for record in records.iter_mut().filter(|r| !r.thumbnail.is_resolved()) {
            error!(title = %record.title, "thumbnail task never completed");
            record.thumbnail = Thumbnail::Absent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trendscan_adapters::ProviderError;
    use trendscan_core::{RawVideoDetails, SearchCandidate};

    struct NoThumbnails;

    #[async_trait]
    impl ThumbnailSource for NoThumbnails {
        async fn fetch(&self, _url: &str, _file_stem: &str) -> Option<String> {
            None
        }
    }

    struct LocalThumbnails;

    #[async_trait]
    impl ThumbnailSource for LocalThumbnails {
        async fn fetch(&self, _url: &str, file_stem: &str) -> Option<String> {
            Some(format!("thumbnails/{file_stem}.jpg"))
        }
    }

    #[derive(Default)]
    struct ScriptedProvider {
        candidates: Vec<SearchCandidate>,
        fail_search: bool,
        detail_calls: AtomicUsize,
        requested_limit: AtomicUsize,
    }

    #[async_trait]
    impl VideoProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchCandidate>, ProviderError> {
            self.requested_limit.store(limit, Ordering::SeqCst);
            if self.fail_search {
                return Err(ProviderError::Unavailable("search".into()));
            }
            Ok(self.candidates.iter().take(limit).cloned().collect())
        }

        async fn video_details(&self, url: &str) -> Result<RawVideoDetails, ProviderError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            if url.contains("broken") {
                return Err(ProviderError::Unavailable(url.to_string()));
            }
            let day = url.rsplit('/').next().unwrap_or("1");
            Ok(RawVideoDetails {
                title: Some(format!("video {day}")),
                upload_date: Some(json!(format!("202401{day:0>2}"))),
                view_count: Some(json!(10)),
                thumbnail: Some(format!("https://img.example/{day}.jpg")),
                ..Default::default()
            })
        }
    }

    fn candidates(links: &[&str]) -> Vec<SearchCandidate> {
        links.iter().map(|l| SearchCandidate::new("t", *l)).collect()
    }

    fn pipeline(provider: Arc<ScriptedProvider>) -> SearchPipeline {
        SearchPipeline::new(provider, Arc::new(LocalThumbnails), "static")
    }

    #[test]
    fn query_quotes_each_keyword_and_ors_them() {
        let keywords = vec!["cats".to_string(), "funny \"dogs\"".to_string()];
        assert_eq!(build_query(&keywords), "\"cats\" OR \"funny dogs\"");
    }

    #[tokio::test]
    async fn blank_keywords_short_circuit() {
        let provider = Arc::new(ScriptedProvider::default());
        let out = pipeline(provider.clone()).run(&["  ", ""], 10).await;
        assert!(out.is_empty());
        assert_eq!(provider.requested_limit.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_failure_returns_empty() {
        let provider = Arc::new(ScriptedProvider {
            candidates: candidates(&["https://v/1"]),
            fail_search: true,
            ..Default::default()
        });
        assert!(pipeline(provider.clone()).run(&["cats"], 5).await.is_empty());
        assert_eq!(provider.detail_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn asks_for_twice_the_clamped_count() {
        let provider = Arc::new(ScriptedProvider::default());
        pipeline(provider.clone()).run(&["cats"], 100).await;
        assert_eq!(provider.requested_limit.load(Ordering::SeqCst), 40);
        pipeline(provider.clone()).run(&["cats"], 1).await;
        assert_eq!(provider.requested_limit.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn failed_and_linkless_candidates_do_not_count_toward_cap() {
        let mut list = candidates(&["https://v/broken-a", "https://v/1"]);
        list.push(SearchCandidate {
            title: Some("no link".into()),
            link: None,
        });
        list.extend(candidates(&["https://v/2", "https://v/3", "https://v/4", "https://v/5", "https://v/6"]));
        let provider = Arc::new(ScriptedProvider {
            candidates: list,
            ..Default::default()
        });

        let out = pipeline(provider.clone()).run(&["cats"], 5).await;

        let urls: Vec<_> = out.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://v/5", "https://v/4", "https://v/3", "https://v/2", "https://v/1"]);
        // broken-a, then 1..=5; enrichment stops once five succeed
        assert_eq!(provider.detail_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn repeated_links_are_enriched_once_by_default() {
        let provider = Arc::new(ScriptedProvider {
            candidates: candidates(&["https://v/1", "https://v/1", "https://v/2"]),
            ..Default::default()
        });
        let out = pipeline(provider.clone()).run(&["cats", "kittens"], 5).await;
        assert_eq!(out.len(), 2);
        assert_eq!(provider.detail_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeated_links_rank_independently_when_dedup_is_off() {
        let provider = Arc::new(ScriptedProvider {
            candidates: candidates(&["https://v/1", "https://v/1", "https://v/2"]),
            ..Default::default()
        });
        let out = pipeline(provider.clone())
            .with_dedup_links(false)
            .run(&["cats", "kittens"], 5)
            .await;
        let urls: Vec<_> = out.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://v/2", "https://v/1", "https://v/1"]);
        // same id, different rank index: file names still differ
        assert_eq!(out[1].thumbnail, Thumbnail::Local("thumbnails/thumbnail_1_1.jpg".into()));
        assert_eq!(out[2].thumbnail, Thumbnail::Local("thumbnails/thumbnail_1_2.jpg".into()));
    }

    #[tokio::test]
    async fn thumbnails_resolve_to_local_or_absent() {
        let provider = Arc::new(ScriptedProvider {
            candidates: candidates(&["https://v/1", "https://v/2"]),
            ..Default::default()
        });
        let out = SearchPipeline::new(provider, Arc::new(NoThumbnails), "static")
            .run(&["cats"], 5)
            .await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.thumbnail == Thumbnail::Absent));
    }

    #[tokio::test]
    async fn unusable_thumbnail_urls_are_never_submitted() {
        let pipeline = SearchPipeline::new(
            Arc::new(ScriptedProvider::default()),
            Arc::new(LocalThumbnails),
            "static",
        );
        let mut records = vec![
            VideoRecord::from_details(
                "https://www.youtube.com/watch?v=aaa",
                RawVideoDetails {
                    thumbnail: Some("N/A".into()),
                    ..Default::default()
                },
            ),
            VideoRecord::from_details(
                "https://www.youtube.com/watch?v=bbb",
                RawVideoDetails {
                    thumbnail: Some("https://img.example/b.jpg".into()),
                    ..Default::default()
                },
            ),
        ];
        pipeline.resolve_thumbnails(&mut records).await;
        assert_eq!(records[0].thumbnail, Thumbnail::Absent);
        assert_eq!(records[1].thumbnail, Thumbnail::Local("thumbnails/thumbnail_bbb_1.jpg".into()));
    }
}
