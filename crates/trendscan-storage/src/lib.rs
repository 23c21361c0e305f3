//! Image retrieval + thumbnail storage for trendscan.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use image::{DynamicImage, ImageFormat};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Formats a thumbnail is expected to arrive in; anything else is saved with a warning.
pub const ACCEPTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::WebP,
];

const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt HTTP GET with a bounded timeout. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unrecognized or corrupt image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// An image ready to be written: either re-encoded JPEG or untouched animation bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub source_format: ImageFormat,
    pub extension: &'static str,
    pub bytes: Vec<u8>,
}

/// Decode the payload, warn on unexpected formats, and normalize it for storage.
///
/// GIFs keep their original bytes so animation survives; every other format is
/// flattened to RGB and re-encoded as JPEG.
pub fn prepare_image(bytes: &[u8]) -> Result<PreparedImage, image::ImageError> {
    let format = image::guess_format(bytes)?;
    let decoded = image::load_from_memory_with_format(bytes, format)?;

    if !ACCEPTED_FORMATS.contains(&format) {
        warn!(?format, "thumbnail is not a standard web image format; saving anyway");
    }

    if format == ImageFormat::Gif {
        return Ok(PreparedImage {
            source_format: format,
            extension: "gif",
            bytes: bytes.to_vec(),
        });
    }

    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)?;
    Ok(PreparedImage {
        source_format: format,
        extension: "jpg",
        bytes: out,
    })
}

/// Thumbnail files under a well-known static root.
#[derive(Debug, Clone)]
pub struct ThumbnailStore {
    static_root: PathBuf,
    subdir: String,
}

impl ThumbnailStore {
    pub fn new(static_root: impl Into<PathBuf>, subdir: impl Into<String>) -> Self {
        Self {
            static_root: static_root.into(),
            subdir: subdir.into(),
        }
    }

    pub fn static_root(&self) -> &Path {
        &self.static_root
    }

    pub fn directory(&self) -> PathBuf {
        self.static_root.join(&self.subdir)
    }

    /// Path relative to the static root, always `/`-separated.
    pub fn relative_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.subdir.trim_matches('/'), file_name)
    }

    /// Resolve a stored relative reference back onto the filesystem.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        resolve_static_path(&self.static_root, relative)
    }

    /// Write via temp file + rename so a failed write never leaves a partial image.
    pub async fn write(&self, file_name: &str, bytes: &[u8]) -> Result<String, ThumbnailError> {
        let dir = self.directory();
        fs::create_dir_all(&dir).await.map_err(|source| ThumbnailError::Io {
            path: dir.clone(),
            source,
        })?;

        let final_path = dir.join(file_name);
        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &final_path).await
        }
        .await;

        match written {
            Ok(()) => Ok(self.relative_path(file_name)),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                let _ = fs::remove_file(&final_path).await;
                Err(ThumbnailError::Io {
                    path: final_path,
                    source,
                })
            }
        }
    }
}

/// Join a `/`-separated reference onto `root`, ignoring any component that
/// could escape it.
pub fn resolve_static_path(root: &Path, relative: &str) -> PathBuf {
    relative
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

/// Downloads one remote image and persists it through a [`ThumbnailStore`].
#[derive(Debug, Clone)]
pub struct ThumbnailFetcher {
    http: HttpFetcher,
    store: ThumbnailStore,
}

impl ThumbnailFetcher {
    pub fn new(http: HttpFetcher, store: ThumbnailStore) -> Self {
        Self { http, store }
    }

    pub fn store(&self) -> &ThumbnailStore {
        &self.store
    }

    /// Fetch, validate and store `url` as `<file_stem>.<ext>`. Failures are
    /// logged and reported as `None`.
    pub async fn fetch(&self, url: &str, file_stem: &str) -> Option<String> {
        let span = info_span!("thumbnail_fetch", url, file_stem);
        match self.try_fetch(url, file_stem).instrument(span).await {
            Ok(relative) => {
                info!(url, path = %relative, "thumbnail saved");
                Some(relative)
            }
            Err(err) => {
                warn!(url, error = %err, "thumbnail download failed");
                None
            }
        }
    }

    pub async fn try_fetch(&self, url: &str, file_stem: &str) -> Result<String, ThumbnailError> {
        let response = self.http.fetch_bytes(url).await?;
        let prepared =
            tokio::task::spawn_blocking(move || prepare_image(&response.body)).await??;
        let file_name = format!("{file_stem}.{}", prepared.extension);
        self.store.write(&file_name, &prepared.bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use image::{ImageBuffer, Rgb, Rgba};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(8, 6, Rgba([200, 10, 10, 255])));
        let img = if format == ImageFormat::Gif || format == ImageFormat::Png {
            img
        } else {
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(8, 6, Rgb([200, 10, 10])))
        };
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), format).expect("encode");
        bytes
    }

    async fn serve(route: &str, template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    fn fetcher(root: &Path) -> ThumbnailFetcher {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        ThumbnailFetcher::new(http, ThumbnailStore::new(root, "thumbnails"))
    }

    #[test]
    fn png_is_normalized_to_jpeg() {
        let prepared = prepare_image(&encoded(ImageFormat::Png)).expect("prepare");
        assert_eq!(prepared.source_format, ImageFormat::Png);
        assert_eq!(prepared.extension, "jpg");
        assert_eq!(image::guess_format(&prepared.bytes).expect("guess"), ImageFormat::Jpeg);
    }

    #[test]
    fn gif_bytes_are_kept_verbatim() {
        let gif = encoded(ImageFormat::Gif);
        let prepared = prepare_image(&gif).expect("prepare");
        assert_eq!(prepared.extension, "gif");
        assert_eq!(prepared.bytes, gif);
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert!(prepare_image(b"<html>not an image</html>").is_err());
    }

    #[test]
    fn static_paths_cannot_escape_root() {
        let root = Path::new("/srv/static");
        assert_eq!(
            resolve_static_path(root, "thumbnails/a.jpg"),
            PathBuf::from("/srv/static/thumbnails/a.jpg")
        );
        assert_eq!(
            resolve_static_path(root, "../../etc/passwd"),
            PathBuf::from("/srv/static/etc/passwd")
        );
    }

    #[tokio::test]
    async fn fetch_returns_path_relative_to_static_root() {
        let server = serve("/hq.png", ResponseTemplate::new(200).set_body_bytes(encoded(ImageFormat::Png))).await;
        let dir = tempdir().expect("tempdir");
        let fetcher = fetcher(dir.path());

        let relative = fetcher
            .fetch(&format!("{}/hq.png", server.uri()), "thumbnail_abc_0")
            .await
            .expect("saved");

        assert_eq!(relative, "thumbnails/thumbnail_abc_0.jpg");
        assert!(dir.path().join("thumbnails/thumbnail_abc_0.jpg").exists());
    }

    #[tokio::test]
    async fn not_found_yields_none_and_no_file() {
        let server = serve("/missing.jpg", ResponseTemplate::new(404)).await;
        let dir = tempdir().expect("tempdir");
        let fetcher = fetcher(dir.path());

        let result = fetcher
            .fetch(&format!("{}/missing.jpg", server.uri()), "thumbnail_x_1")
            .await;

        assert!(result.is_none());
        assert!(!dir.path().join("thumbnails/thumbnail_x_1.jpg").exists());
    }

    #[tokio::test]
    async fn corrupt_image_yields_none_and_leaves_directory_clean() {
        let server = serve(
            "/broken.jpg",
            ResponseTemplate::new(200).set_body_bytes(b"\xFF\xD8\xFFtruncated".to_vec()),
        )
        .await;
        let dir = tempdir().expect("tempdir");
        let fetcher = fetcher(dir.path());

        let result = fetcher
            .fetch(&format!("{}/broken.jpg", server.uri()), "thumbnail_y_2")
            .await;

        assert!(result.is_none());
        let leftovers = std::fs::read_dir(dir.path().join("thumbnails"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn write_creates_missing_directory() {
        let dir = tempdir().expect("tempdir");
        let store = ThumbnailStore::new(dir.path().join("nested/static"), "thumbs");
        let relative = store.write("a.jpg", b"bytes").await.expect("write");
        assert_eq!(relative, "thumbs/a.jpg");
        assert_eq!(std::fs::read(store.resolve(&relative)).expect("read"), b"bytes");
    }
}
