//! Immutable dataset artifact storage, HTTP fetch, and the download stage.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;
use zip::ZipArchive;

pub const CRATE_NAME: &str = "orderflow-storage";

pub const KAGGLE_DOWNLOAD_BASE: &str = "https://www.kaggle.com/api/v1/datasets/download";
pub const DEFAULT_DATASET: &str = "ayushparwal2026/online-ecommerce";
pub const DEFAULT_DATASET_FILE: &str = "Online-eCommerce.csv";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(sanitize_path_segment(source_id))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        match write_atomically(&absolute_path, bytes, false).await? {
            WriteOutcome::Written => Ok(artifact(false)),
            WriteOutcome::AlreadyPresent => Ok(artifact(true)),
        }
    }
}

enum WriteOutcome {
    Written,
    AlreadyPresent,
}

/// Temp file in the target directory, then rename. With `replace` unset an existing
/// target wins and the temp file is discarded.
async fn write_atomically(target: &Path, bytes: &[u8], replace: bool) -> anyhow::Result<WriteOutcome> {
    let parent = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if !replace && fs::try_exists(target).await.unwrap_or(false) {
        let _ = fs::remove_file(&temp_path).await;
        return Ok(WriteOutcome::AlreadyPresent);
    }

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(WriteOutcome::Written),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp file {} -> {}",
                    temp_path.display(),
                    target.display()
                )
            })
        }
    }
}

fn sanitize_path_segment(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "dataset".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // dataset archives are large; the page-sized default is too tight
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        auth: Option<&BasicAuth>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url, auth).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        auth: Option<&BasicAuth>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(auth) = auth {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Where the tabular dataset comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    /// `owner/slug` on Kaggle; the archive member `file_name` is the table.
    Kaggle { dataset: String, file_name: String },
    /// Any HTTP(S) URL serving either the table or a zip containing `file_name`.
    Url { url: String, file_name: String },
    /// A file already on disk.
    Local { path: PathBuf },
}

impl Default for DatasetSource {
    fn default() -> Self {
        DatasetSource::Kaggle {
            dataset: DEFAULT_DATASET.to_string(),
            file_name: DEFAULT_DATASET_FILE.to_string(),
        }
    }
}

impl DatasetSource {
    /// Parses `kaggle:owner/slug`, `http(s)://...`, `file:path`, or a bare path.
    pub fn from_spec(spec: &str, file_name: &str) -> Self {
        let spec = spec.trim();
        if let Some(dataset) = spec.strip_prefix("kaggle:") {
            DatasetSource::Kaggle {
                dataset: dataset.trim_matches('/').to_string(),
                file_name: file_name.to_string(),
            }
        } else if spec.starts_with("http://") || spec.starts_with("https://") {
            DatasetSource::Url {
                url: spec.to_string(),
                file_name: file_name.to_string(),
            }
        } else {
            let path = spec.strip_prefix("file:").unwrap_or(spec);
            DatasetSource::Local {
                path: PathBuf::from(path),
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            DatasetSource::Kaggle { dataset, .. } => format!("kaggle:{dataset}"),
            DatasetSource::Url { url, .. } => url.clone(),
            DatasetSource::Local { path } => path.display().to_string(),
        }
    }

    fn source_id(&self) -> String {
        match self {
            DatasetSource::Kaggle { dataset, .. } => dataset.replace('/', "__"),
            DatasetSource::Url { .. } => "url".to_string(),
            DatasetSource::Local { .. } => "local".to_string(),
        }
    }
}

/// Kaggle API credentials: `KAGGLE_USERNAME`/`KAGGLE_KEY`, else `kaggle.json` in
/// `KAGGLE_CONFIG_DIR` or `~/.kaggle`.
#[derive(Debug, Clone, Deserialize)]
pub struct KaggleCredentials {
    pub username: String,
    pub key: String,
}

impl KaggleCredentials {
    pub fn from_env() -> Option<Self> {
        if let (Ok(username), Ok(key)) = (std::env::var("KAGGLE_USERNAME"), std::env::var("KAGGLE_KEY")) {
            return Some(Self { username, key });
        }
        let dir = std::env::var("KAGGLE_CONFIG_DIR")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".kaggle")))
            .ok()?;
        Self::from_file(dir.join("kaggle.json")).ok()
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn basic_auth(&self) -> BasicAuth {
        BasicAuth {
            username: self.username.clone(),
            password: self.key.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedDataset {
    pub source: String,
    pub tabular_path: PathBuf,
    pub artifact: Option<StoredArtifact>,
    pub unpacked_from_archive: bool,
}

/// The download stage: fetch, archive immutably, and materialize the table on disk.
#[derive(Debug)]
pub struct DatasetDownloader {
    artifacts: ArtifactStore,
    http: HttpFetcher,
    download_dir: PathBuf,
    kaggle: Option<KaggleCredentials>,
}

impl DatasetDownloader {
    pub fn new(
        artifacts: ArtifactStore,
        http: HttpFetcher,
        download_dir: impl Into<PathBuf>,
        kaggle: Option<KaggleCredentials>,
    ) -> Self {
        Self {
            artifacts,
            http,
            download_dir: download_dir.into(),
            kaggle,
        }
    }

    pub async fn download(
        &self,
        run_id: Uuid,
        source: &DatasetSource,
    ) -> anyhow::Result<DownloadedDataset> {
        let (url, file_name, auth) = match source {
            DatasetSource::Local { path } => {
                if !fs::try_exists(path)
                    .await
                    .with_context(|| format!("checking {}", path.display()))?
                {
                    bail!("local dataset {} does not exist", path.display());
                }
                info!(%run_id, path = %path.display(), "using local dataset file");
                return Ok(DownloadedDataset {
                    source: source.label(),
                    tabular_path: path.clone(),
                    artifact: None,
                    unpacked_from_archive: false,
                });
            }
            DatasetSource::Kaggle { dataset, file_name } => (
                format!("{KAGGLE_DOWNLOAD_BASE}/{dataset}"),
                file_name,
                self.kaggle.as_ref().map(KaggleCredentials::basic_auth),
            ),
            DatasetSource::Url { url, file_name } => (url.clone(), file_name, None),
        };

        let fetched_at = Utc::now();
        let source_id = source.source_id();
        let response = self
            .http
            .fetch_bytes(run_id, &source_id, &url, auth.as_ref())
            .await
            .with_context(|| format!("downloading {url}"))?;

        let is_archive = looks_like_zip(&response.body);
        let extension = if is_archive { "zip" } else { extension_of(file_name) };
        let artifact = self
            .artifacts
            .store_bytes(fetched_at, &source_id, extension, &response.body)
            .await?;

        let tabular_path = self.download_dir.join(file_name);
        let table_bytes = match unpack_member(&response.body, file_name)? {
            Some(bytes) => bytes,
            None => response.body,
        };
        write_atomically(&tabular_path, &table_bytes, true).await?;

        info!(
            %run_id,
            url = %response.final_url,
            status = response.status.as_u16(),
            bytes = artifact.byte_size,
            sha256 = %artifact.content_hash,
            deduplicated = artifact.deduplicated,
            path = %tabular_path.display(),
            "dataset downloaded"
        );

        Ok(DownloadedDataset {
            source: source.label(),
            tabular_path,
            artifact: Some(artifact),
            unpacked_from_archive: is_archive,
        })
    }
}

fn extension_of(file_name: &str) -> &str {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
}

/// Upper bound on an unpacked archive member.
pub const MAX_MEMBER_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub fn looks_like_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04")
}

/// Returns the bytes of `member` when `bytes` is a zip archive, `None` when it is not.
/// Members nested in a directory match on their final path component.
pub fn unpack_member(bytes: &[u8], member: &str) -> anyhow::Result<Option<Vec<u8>>> {
    unpack_member_limited(bytes, member, MAX_MEMBER_BYTES)
}

fn unpack_member_limited(
    bytes: &[u8],
    member: &str,
    limit: u64,
) -> anyhow::Result<Option<Vec<u8>>> {
    if !looks_like_zip(bytes) {
        return Ok(None);
    }
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("opening zip archive")?;
    let name = archive
        .file_names()
        .find(|name| *name == member || name.rsplit('/').next() == Some(member))
        .map(str::to_string);
    let Some(name) = name else {
        bail!("archive does not contain {member}");
    };
    let mut entry = archive
        .by_name(&name)
        .with_context(|| format!("opening archive member {name}"))?;
    // The declared size comes from the archive and is not trusted for allocation.
    let mut out = Vec::new();
    (&mut entry)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .with_context(|| format!("reading archive member {name}"))?;
    if out.len() as u64 > limit {
        bail!("archive member {name} is larger than {limit} bytes");
    }
    Ok(Some(out))
}
