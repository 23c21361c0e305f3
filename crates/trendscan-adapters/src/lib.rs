//! Video provider contracts + yt-dlp and fixture-backed implementations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use trendscan_core::{RawVideoDetails, SearchCandidate};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("malformed provider response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no details available for {0}")]
    Unavailable(String),
}

/// Search + metadata lookup against a video platform. Metadata only; no media
/// is ever downloaded through this trait.
#[async_trait]
pub trait VideoProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchCandidate>, ProviderError>;

    async fn video_details(&self, url: &str) -> Result<RawVideoDetails, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub binary: PathBuf,
    pub timeout: Duration,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("yt-dlp"),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Provider backed by the `yt-dlp` executable.
#[derive(Debug, Clone, Default)]
pub struct YtDlpProvider {
    config: YtDlpConfig,
}

#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    #[serde(default)]
    entries: Vec<FlatEntry>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
}

impl YtDlpProvider {
    pub fn new(config: YtDlpConfig) -> Self {
        Self { config }
    }

    pub fn search_target(query: &str, limit: usize) -> String {
        format!("ytsearch{}:{}", limit.max(1), query)
    }

    fn program(&self) -> String {
        self.config.binary.display().to_string()
    }

    async fn run_json(&self, args: &[&str]) -> Result<Vec<u8>, ProviderError> {
        let program = self.program();
        debug!(program = %program, ?args, "invoking provider");

        let child = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProviderError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout {
                program: program.clone(),
                secs: self.config.timeout.as_secs(),
            })?
            .map_err(|source| ProviderError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProviderError::Exit {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Map a `--flat-playlist` search dump onto candidates, preserving order.
pub fn parse_search_output(bytes: &[u8]) -> Result<Vec<SearchCandidate>, ProviderError> {
    let playlist: FlatPlaylist = serde_json::from_slice(bytes)?;
    Ok(playlist
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .webpage_url
                .or(entry.url)
                .filter(|u| u.starts_with("http"))
                .or_else(|| {
                    entry
                        .id
                        .map(|id| format!("https://www.youtube.com/watch?v={id}"))
                });
            SearchCandidate {
                title: entry.title,
                link,
            }
        })
        .collect())
}

pub fn parse_details_output(bytes: &[u8]) -> Result<RawVideoDetails, ProviderError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[async_trait]
impl VideoProvider for YtDlpProvider {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchCandidate>, ProviderError> {
        let target = Self::search_target(query, limit);
        let stdout = self
            .run_json(&["--flat-playlist", "--dump-single-json", "--no-warnings", &target])
            .await?;
        parse_search_output(&stdout)
    }

    async fn video_details(&self, url: &str) -> Result<RawVideoDetails, ProviderError> {
        let stdout = self
            .run_json(&[
                "--dump-single-json",
                "--skip-download",
                "--no-playlist",
                "--no-warnings",
                url,
            ])
            .await?;
        parse_details_output(&stdout)
    }
}

/// Captured provider responses: search candidates in provider order and
/// detail bundles keyed by URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub candidates: Vec<SearchCandidate>,
    #[serde(default)]
    pub details: HashMap<String, RawVideoDetails>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline provider replaying a [`FixtureBundle`].
#[derive(Debug, Clone, Default)]
pub struct FixtureProvider {
    bundle: FixtureBundle,
}

impl FixtureProvider {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn with_video(mut self, title: &str, url: &str, details: RawVideoDetails) -> Self {
        self.bundle.candidates.push(SearchCandidate::new(title, url));
        self.bundle.details.insert(url.to_string(), details);
        self
    }
}

#[async_trait]
impl VideoProvider for FixtureProvider {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchCandidate>, ProviderError> {
        Ok(self.bundle.candidates.iter().take(limit).cloned().collect())
    }

    async fn video_details(&self, url: &str) -> Result<RawVideoDetails, ProviderError> {
        self.bundle
            .details
            .get(url)
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable(url.to_string()))
    }
}
