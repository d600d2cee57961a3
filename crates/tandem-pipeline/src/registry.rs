//! Registry transports: where published archives are uploaded to.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use thiserror::Error;

use crate::credentials::Credentials;
use crate::fsx::write_atomic;

/// Errors from a registry upload.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid registry url '{0}'")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("registry rejected upload with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A place archives can be uploaded to.
pub trait RegistryTransport: Send + Sync {
    /// Where uploads go, for logs and reports.
    fn describe(&self) -> String;

    /// Upload `body` to `path` (relative to the registry root). Returns the
    /// location of the stored file.
    fn upload(
        &self,
        path: &str,
        body: &[u8],
        credentials: &Credentials,
    ) -> Result<String, TransportError>;
}

/// Open the transport for a registry URL.
///
/// `file://` URLs map to a [`DirectoryRegistry`], `http(s)://` to an
/// [`HttpRegistry`].
pub fn open_registry(
    url: &str,
    timeout: Duration,
) -> Result<Box<dyn RegistryTransport>, TransportError> {
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        return Ok(Box::new(DirectoryRegistry::new(path)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(HttpRegistry::new(url, timeout)?));
    }
    Err(TransportError::InvalidUrl(url.to_string()))
}

/// Maven-style HTTP registry: one authenticated `PUT` per file.
pub struct HttpRegistry {
    base_url: String,
    client: Client,
}

/// Longest response body quoted in a rejection.
const MAX_ERROR_BODY: usize = 512;

impl HttpRegistry {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl RegistryTransport for HttpRegistry {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    fn upload(
        &self,
        path: &str,
        body: &[u8],
        credentials: &Credentials,
    ) -> Result<String, TransportError> {
        let url = self.url_for(path);
        let response = self
            .client
            .put(&url)
            .basic_auth(credentials.username(), Some(credentials.password()))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body.to_vec())
            .send()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(url)
    }
}

/// A local directory laid out like a registry.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RegistryTransport for DirectoryRegistry {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn upload(
        &self,
        path: &str,
        body: &[u8],
        _credentials: &Credentials,
    ) -> Result<String, TransportError> {
        if path.split('/').any(|part| part == "..") {
            return Err(TransportError::InvalidUrl(path.to_string()));
        }
        let dest = self.root.join(path.trim_start_matches('/'));
        write_atomic(&dest, body)?;
        Ok(format!("file://{}", dest.display()))
    }
}
