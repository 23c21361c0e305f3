//! Fixed-size thumbnail worker pool.
//!
//! Work items go in as `(index, url)` jobs on a shared queue; each worker
//! reports exactly one `(index, result)` completion per job on the result
//! channel, in whatever order downloads finish.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error};
use trendscan_storage::ThumbnailFetcher;

/// Anything that can turn a remote image URL into a static-root-relative path.
#[async_trait]
pub trait ThumbnailSource: Send + Sync + 'static {
    async fn fetch(&self, url: &str, file_stem: &str) -> Option<String>;
}

#[async_trait]
impl ThumbnailSource for ThumbnailFetcher {
    async fn fetch(&self, url: &str, file_stem: &str) -> Option<String> {
        ThumbnailFetcher::fetch(self, url, file_stem).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailJob {
    pub index: usize,
    pub url: String,
    pub file_stem: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailCompletion {
    pub index: usize,
    pub path: Option<String>,
}

/// Run every job on at most `workers` concurrent tasks and drain exactly one
/// completion per submitted job. A job that panics completes as `None`.
pub async fn run_thumbnail_pool(
    source: Arc<dyn ThumbnailSource>,
    workers: usize,
    jobs: Vec<ThumbnailJob>,
) -> Vec<ThumbnailCompletion> {
    let submitted = jobs.len();
    if submitted == 0 {
        return Vec::new();
    }

    let (job_tx, job_rx) = mpsc::channel::<ThumbnailJob>(submitted);
    for job in jobs {
        if job_tx.send(job).await.is_err() {
            break;
        }
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let (done_tx, mut done_rx) = mpsc::channel::<ThumbnailCompletion>(submitted);
    let mut tasks = JoinSet::new();
    for worker in 0..workers.clamp(1, submitted) {
        let job_rx = job_rx.clone();
        let done_tx = done_tx.clone();
        let source = source.clone();
        tasks.spawn(async move {
            loop {
                let next = job_rx.lock().await.recv().await;
                let Some(job) = next else {
                    break;
                };
                debug!(worker, index = job.index, url = %job.url, "thumbnail job started");
                let path = match AssertUnwindSafe(source.fetch(&job.url, &job.file_stem))
                    .catch_unwind()
                    .await
                {
                    Ok(path) => path,
                    Err(_) => {
                        error!(title = %job.title, url = %job.url, "thumbnail task panicked");
                        None
                    }
                };
                let completion = ThumbnailCompletion {
                    index: job.index,
                    path,
                };
                if done_tx.send(completion).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(done_tx);

    let mut completions = Vec::with_capacity(submitted);
    while completions.len() < submitted {
        match done_rx.recv().await {
            Some(completion) => completions.push(completion),
            None => break,
        }
    }
    while tasks.join_next().await.is_some() {}
    completions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Tracking {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ThumbnailSource for Tracking {
        async fn fetch(&self, url: &str, file_stem: &str) -> Option<String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            // later jobs finish first so completion order differs from submission order
            let delay = 40u64.saturating_sub(file_stem.len() as u64 * 2);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if url.ends_with("404") {
                None
            } else {
                Some(format!("thumbnails/{file_stem}.jpg"))
            }
        }
    }

    struct Panicky;

    #[async_trait]
    impl ThumbnailSource for Panicky {
        async fn fetch(&self, url: &str, file_stem: &str) -> Option<String> {
            if url.contains("boom") {
                panic!("decoder exploded");
            }
            Some(format!("thumbnails/{file_stem}.jpg"))
        }
    }

    fn job(index: usize, url: &str) -> ThumbnailJob {
        ThumbnailJob {
            index,
            url: url.to_string(),
            file_stem: format!("t{}", "x".repeat(index)),
            title: format!("video {index}"),
        }
    }

    #[tokio::test]
    async fn every_job_completes_once_within_the_bound() {
        let source = Arc::new(Tracking::default());
        let jobs = (0..12).map(|i| job(i, &format!("https://img/{i}"))).collect();

        let mut done = run_thumbnail_pool(source.clone(), 3, jobs).await;

        assert_eq!(done.len(), 12);
        assert!(source.peak.load(Ordering::SeqCst) <= 3);
        done.sort_by_key(|c| c.index);
        assert!(done.iter().enumerate().all(|(i, c)| c.index == i && c.path.is_some()));
    }

    #[tokio::test]
    async fn failed_fetch_completes_as_none() {
        let source = Arc::new(Tracking::default());
        let jobs = vec![job(0, "https://img/ok"), job(1, "https://img/404")];
        let mut done = run_thumbnail_pool(source, 10, jobs).await;
        done.sort_by_key(|c| c.index);
        assert!(done[0].path.is_some());
        assert_eq!(done[1].path, None);
    }

    #[tokio::test]
    async fn panicking_job_resolves_to_none_without_losing_others() {
        let jobs = vec![job(0, "https://img/a"), job(1, "https://img/boom"), job(2, "https://img/c")];
        let mut done = run_thumbnail_pool(Arc::new(Panicky), 1, jobs).await;
        done.sort_by_key(|c| c.index);
        assert_eq!(done.len(), 3);
        assert!(done[0].path.is_some());
        assert_eq!(done[1].path, None);
        assert!(done[2].path.is_some());
    }

    #[tokio::test]
    async fn empty_job_list_spawns_nothing() {
        assert!(run_thumbnail_pool(Arc::new(Panicky), 4, Vec::new()).await.is_empty());
    }
}
