//! Page cache, record files and the HTTP chart fetcher.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use hot100_core::{chart_url, ChartEntry, RecordError};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hot100-storage";

pub const DEFAULT_BASE_URL: &str = "https://www.billboard.com/charts/hot-100";

/// The only content type a chart page is accepted with.
pub const EXPECTED_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

#[derive(Debug, Clone)]
pub struct CachedPage {
    pub date: NaiveDate,
    pub path: PathBuf,
    pub byte_size: usize,
    pub content_hash: String,
}

/// One raw HTML file per chart date, never rewritten once present.
#[derive(Debug, Clone)]
pub struct PageCache {
    root: PathBuf,
}

impl PageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!("{}.html", date.format("%Y-%m-%d")))
    }

    pub async fn contains(&self, date: NaiveDate) -> std::io::Result<bool> {
        fs::try_exists(self.path_for(date)).await
    }

    /// Open a temp file next to the final cache path; nothing is visible
    /// under the date's name until [`PageCacheWriter::commit`].
    pub async fn begin(&self, date: NaiveDate) -> anyhow::Result<PageCacheWriter> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating page cache directory {}", self.root.display()))?;

        let final_path = self.path_for(date);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", date.format("%Y-%m-%d"), Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page file {}", temp_path.display()))?;

        Ok(PageCacheWriter {
            date,
            file,
            temp_path,
            final_path,
            hasher: Sha256::new(),
            byte_size: 0,
        })
    }

    pub async fn store_bytes(&self, date: NaiveDate, bytes: &[u8]) -> anyhow::Result<CachedPage> {
        let mut writer = self.begin(date).await?;
        if let Err(err) = writer.write(bytes).await {
            writer.abort().await;
            return Err(err);
        }
        writer.commit().await
    }
}

#[derive(Debug)]
pub struct PageCacheWriter {
    date: NaiveDate,
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    hasher: Sha256,
    byte_size: usize,
}

impl PageCacheWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.file
            .write_all(chunk)
            .await
            .with_context(|| format!("writing temp page file {}", self.temp_path.display()))?;
        self.hasher.update(chunk);
        self.byte_size += chunk.len();
        Ok(())
    }

    pub async fn commit(mut self) -> anyhow::Result<CachedPage> {
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing temp page file {}", self.temp_path.display()))?;
        let Self {
            date,
            file,
            temp_path,
            final_path,
            hasher,
            byte_size,
        } = self;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp page {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            });
        }

        Ok(CachedPage {
            date,
            path: final_path,
            byte_size,
            content_hash: hex::encode(hasher.finalize()),
        })
    }

    pub async fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accepted,
    BadStatus,
    BadContentType,
}

pub fn classify_response(status: StatusCode, content_type: Option<&str>) -> Acceptance {
    if status != StatusCode::OK {
        Acceptance::BadStatus
    } else if content_type != Some(EXPECTED_CONTENT_TYPE) {
        Acceptance::BadContentType
    } else {
        Acceptance::Accepted
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Cache(#[from] anyhow::Error),
}

/// Where chart pages come from. `fetch` must only be called for dates the
/// cache does not hold yet; a rejected page yields `Ok(None)`.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn cache(&self) -> &PageCache;

    async fn fetch(&self, date: NaiveDate) -> Result<Option<CachedPage>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    cache: PageCache,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, cache: PageCache) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            cache,
        })
    }

    async fn fetch_inner(&self, date: NaiveDate, url: &str) -> Result<Option<CachedPage>, FetchError> {
        let mut resp = self.client.get(url).send().await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        match classify_response(status, content_type.as_deref()) {
            Acceptance::Accepted => {}
            Acceptance::BadStatus => {
                warn!(%status, "rejecting chart page: unexpected status");
                return Ok(None);
            }
            Acceptance::BadContentType => {
                warn!(
                    content_type = content_type.as_deref().unwrap_or("<none>"),
                    "rejecting chart page: unexpected content type"
                );
                return Ok(None);
            }
        }

        let mut writer = self.cache.begin(date).await?;
        loop {
            let chunk = match resp.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    writer.abort().await;
                    return Err(FetchError::Request(err));
                }
            };
            if let Err(err) = writer.write(&chunk).await {
                writer.abort().await;
                return Err(FetchError::Cache(err));
            }
        }

        let page = writer.commit().await?;
        info!(
            bytes = page.byte_size,
            hash = %page.content_hash,
            path = %page.path.display(),
            "cached chart page"
        );
        Ok(Some(page))
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    fn cache(&self) -> &PageCache {
        &self.cache
    }

    async fn fetch(&self, date: NaiveDate) -> Result<Option<CachedPage>, FetchError> {
        let url = chart_url(&self.base_url, date);
        let span = info_span!("http_fetch", %date, url = %url);
        self.fetch_inner(date, &url).instrument(span).await
    }
}

/// Per-year staging file of serialized chart entries.
///
/// Entries are appended to `<year>.jsonl.partial`; only a finished year is
/// renamed to `<year>.jsonl`, whose presence marks the year as ingested.
#[derive(Debug, Clone)]
pub struct RecordFile {
    year: i32,
    path: PathBuf,
    partial_path: PathBuf,
}

impl RecordFile {
    pub fn new(dir: impl AsRef<Path>, year: i32) -> Self {
        let dir = dir.as_ref();
        Self {
            year,
            path: dir.join(format!("{year}.jsonl")),
            partial_path: dir.join(format!("{year}.jsonl.partial")),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> std::io::Result<bool> {
        fs::try_exists(&self.path).await
    }

    /// Start a fresh staging file, dropping leftovers of an aborted run.
    pub async fn create(&self) -> anyhow::Result<RecordWriter> {
        if let Some(parent) = self.partial_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating record directory {}", parent.display()))?;
        }
        match fs::remove_file(&self.partial_path).await {
            Ok(()) => debug!(path = %self.partial_path.display(), "removed stale partial record file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("removing stale record file {}", self.partial_path.display())
                })
            }
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.partial_path)
            .await
            .with_context(|| format!("opening record file {}", self.partial_path.display()))?;

        Ok(RecordWriter {
            file,
            partial_path: self.partial_path.clone(),
            path: self.path.clone(),
            written: 0,
        })
    }

    pub async fn discard(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing record file {}", self.path.display()))
            }
        }
    }

    /// Line reader over the finished file, `None` if it does not exist.
    pub async fn open_lines(&self) -> anyhow::Result<Option<Lines<BufReader<fs::File>>>> {
        match fs::File::open(&self.path).await {
            Ok(file) => Ok(Some(BufReader::new(file).lines())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("opening record file {}", self.path.display()))
            }
        }
    }

    pub async fn read_entries(&self) -> anyhow::Result<Vec<ChartEntry>> {
        let Some(mut lines) = self.open_lines().await? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        let mut line_no = 0usize;
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("reading {}", self.path.display()))?
        {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let entry = ChartEntry::from_record_line(&line)
                .with_context(|| format!("{}:{line_no}", self.path.display()))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[derive(Debug)]
pub struct RecordWriter {
    file: fs::File,
    partial_path: PathBuf,
    path: PathBuf,
    written: usize,
}

#[derive(Debug, Error)]
pub enum RecordWriteError {
    #[error(transparent)]
    Encode(#[from] RecordError),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RecordWriter {
    pub fn written(&self) -> usize {
        self.written
    }

    pub async fn append(&mut self, entries: &[ChartEntry]) -> Result<(), RecordWriteError> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&entry.to_record_line()?);
            buf.push('\n');
        }
        self.file
            .write_all(buf.as_bytes())
            .await
            .map_err(|source| RecordWriteError::Io {
                path: self.partial_path.clone(),
                source,
            })?;
        self.written += entries.len();
        Ok(())
    }

    /// Flush and publish the staging file under its final name.
    pub async fn finish(mut self) -> anyhow::Result<PathBuf> {
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.partial_path.display()))?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("syncing {}", self.partial_path.display()))?;
        drop(self.file);
        fs::rename(&self.partial_path, &self.path)
            .await
            .with_context(|| {
                format!(
                    "renaming record file {} -> {}",
                    self.partial_path.display(),
                    self.path.display()
                )
            })?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hot100_core::{ChartWeek, Position};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(1984, 2, 18).unwrap()
    }

    #[test]
    fn page_hashing_is_stable() {
        let hash = PageCache::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn committed_page_lands_under_its_date() {
        let dir = tempdir().expect("tempdir");
        let cache = PageCache::new(dir.path().join("html"));
        assert!(!cache.contains(date()).await.unwrap());

        let page = cache
            .store_bytes(date(), b"<html>chart</html>")
            .await
            .expect("store");

        assert_eq!(page.path, dir.path().join("html").join("1984-02-18.html"));
        assert_eq!(page.byte_size, 18);
        assert_eq!(page.content_hash, PageCache::sha256_hex(b"<html>chart</html>"));
        assert!(cache.contains(date()).await.unwrap());
        assert_eq!(std::fs::read(&page.path).unwrap(), b"<html>chart</html>");
    }

    #[tokio::test]
    async fn aborted_page_leaves_no_file() {
        let dir = tempdir().expect("tempdir");
        let cache = PageCache::new(dir.path());
        let mut writer = cache.begin(date()).await.unwrap();
        writer.write(b"<html>half").await.unwrap();
        writer.abort().await;

        assert!(!cache.contains(date()).await.unwrap());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn only_ok_html_utf8_is_accepted() {
        assert_eq!(
            classify_response(StatusCode::OK, Some("text/html; charset=UTF-8")),
            Acceptance::Accepted
        );
        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, Some("text/html; charset=UTF-8")),
            Acceptance::BadStatus
        );
        assert_eq!(
            classify_response(StatusCode::MOVED_PERMANENTLY, None),
            Acceptance::BadStatus
        );
        assert_eq!(
            classify_response(StatusCode::OK, Some("text/html; charset=utf-8")),
            Acceptance::BadContentType
        );
        assert_eq!(
            classify_response(StatusCode::OK, Some("application/json")),
            Acceptance::BadContentType
        );
        assert_eq!(classify_response(StatusCode::OK, None), Acceptance::BadContentType);
    }

    #[tokio::test]
    async fn record_file_is_visible_only_after_finish() {
        let dir = tempdir().expect("tempdir");
        let record = RecordFile::new(dir.path().join("jsonl"), 1984);
        let week = ChartWeek { year: 1984, week: 7 };
        let entries = vec![
            ChartEntry::new(week, Position::Number(1), "Artist One", "Song One"),
            ChartEntry::new(week, Position::Label("2".into()), "Artist Two", "Song Two"),
        ];

        let mut writer = record.create().await.unwrap();
        writer.append(&entries).await.unwrap();
        assert_eq!(writer.written(), 2);
        assert!(!record.exists().await.unwrap());

        let path = writer.finish().await.unwrap();
        assert_eq!(path, dir.path().join("jsonl").join("1984.jsonl"));
        assert!(record.exists().await.unwrap());
        assert_eq!(record.read_entries().await.unwrap(), entries);

        record.discard().await.unwrap();
        assert!(!record.exists().await.unwrap());
        assert!(record.open_lines().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_drops_stale_partial_file() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("2001.jsonl.partial"), "[2001,1,1,\"stale\",\"x\"]\n").unwrap();
        let record = RecordFile::new(dir.path(), 2001);

        let writer = record.create().await.unwrap();
        writer.finish().await.unwrap();

        assert!(record.read_entries().await.unwrap().is_empty());
    }

    fn canned_response(path: &str) -> (&'static str, &'static str, Vec<u8>) {
        match path {
            "/1984-02-18/" => ("404 Not Found", EXPECTED_CONTENT_TYPE, b"gone".to_vec()),
            "/1984-02-25/" => ("200 OK", "text/html; charset=utf-8", b"<html></html>".to_vec()),
            "/1984-03-03/" => ("200 OK", EXPECTED_CONTENT_TYPE, chart_body()),
            _ => ("500 Internal Server Error", "text/plain", Vec::new()),
        }
    }

    fn chart_body() -> Vec<u8> {
        let rows = "<div class=\"o-chart-results-list-row-container\">row</div>\n".repeat(4000);
        format!("<html><body>{rows}</body></html>").into_bytes()
    }

    async fn serve_canned(listener: TcpListener) {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, content_type, body) = canned_response(&path);
                let response_head = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(response_head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    }

    fn cached_files(root: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(root) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn http_fetcher_caches_only_accepted_pages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_canned(listener));

        let dir = tempdir().unwrap();
        let cache = PageCache::new(dir.path().join("html"));
        let fetcher = HttpFetcher::new(
            HttpClientConfig {
                base_url: format!("http://{addr}/"),
                timeout: Duration::from_secs(5),
                user_agent: Some("hot100-test".into()),
            },
            cache.clone(),
        )
        .unwrap();

        let not_found = NaiveDate::from_ymd_opt(1984, 2, 18).unwrap();
        assert!(fetcher.fetch(not_found).await.unwrap().is_none());
        assert!(cached_files(cache.root()).is_empty());

        let lowercase_charset = NaiveDate::from_ymd_opt(1984, 2, 25).unwrap();
        assert!(fetcher.fetch(lowercase_charset).await.unwrap().is_none());
        assert!(cached_files(cache.root()).is_empty());
        assert!(!cache.contains(lowercase_charset).await.unwrap());

        let accepted = NaiveDate::from_ymd_opt(1984, 3, 3).unwrap();
        let page = fetcher.fetch(accepted).await.unwrap().expect("accepted page");
        let body = chart_body();
        assert_eq!(page.path, cache.path_for(accepted));
        assert_eq!(page.byte_size, body.len());
        assert_eq!(page.content_hash, PageCache::sha256_hex(&body));
        assert_eq!(std::fs::read(&page.path).unwrap(), body);
        assert_eq!(cached_files(cache.root()), vec![cache.path_for(accepted)]);
    }
}
