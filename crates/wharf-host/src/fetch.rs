//! Content-addressed module retrieval.
//!
//! A content address names a payload bundle on the retrieval gateway: a tar
//! archive (optionally gzip-compressed) holding one or more payload files.
//! [`ContentFetcher::retrieve`] downloads the bundle and returns the bytes of
//! every regular file it contains. Extraction streams straight from the
//! response body in memory, so no scratch files or directories are ever
//! created — a failed fetch leaves nothing behind.

use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::FetchError;
use crate::manifest::LassieNet;

/// Default HTTP timeout for gateway requests.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// HTTP client for a content-addressed retrieval gateway.
pub struct ContentFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl ContentFetcher {
    pub fn new(net: &LassieNet) -> Self {
        Self::with_timeout(net, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(net: &LassieNet, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "HTTP client build failed, using defaults");
                reqwest::Client::new()
            });
        Self {
            base_url: format!("{}://{}:{}/ipfs", net.scheme, net.host, net.port),
            client,
        }
    }

    /// Full retrieval URL for a content identifier.
    pub fn url_for(&self, id: &str) -> String {
        format!("{}/{id}", self.base_url)
    }

    /// Fetch a bundle by content identifier and return the contents of every
    /// regular file it holds, in archive order.
    pub async fn retrieve(&self, id: &str) -> Result<Vec<Vec<u8>>, FetchError> {
        let url = self.url_for(id);
        tracing::debug!(id, url = %url, "Fetching content-addressed bundle");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                id: id.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let payloads = unpack_payloads(&body)?;

        tracing::info!(id, files = payloads.len(), "Bundle retrieved");
        Ok(payloads)
    }
}

/// Extract the regular files of a (possibly gzip-compressed) tar bundle.
fn unpack_payloads(data: &[u8]) -> Result<Vec<Vec<u8>>, FetchError> {
    if data.starts_with(&GZIP_MAGIC) {
        read_tar_entries(GzDecoder::new(data))
    } else {
        read_tar_entries(data)
    }
}

fn read_tar_entries<R: Read>(reader: R) -> Result<Vec<Vec<u8>>, FetchError> {
    let mut archive = Archive::new(reader);
    let mut payloads = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| FetchError::Archive(format!("cannot read bundle entries: {e}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| FetchError::Archive(format!("cannot read bundle entry: {e}")))?;

        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }

        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        payloads.push(content);
    }

    if payloads.is_empty() {
        return Err(FetchError::Archive("bundle contains no payload files".into()));
    }

    Ok(payloads)
}
