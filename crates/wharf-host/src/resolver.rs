//! Module reference resolution.
//!
//! A module reference is a string naming a WASM module: `file://PATH` for a
//! local file, `IPFS://CID` for a content-addressed fetch, or a bare string
//! matched against both in order. References are compared by their exact
//! textual form — two distinct spellings never share a plugin instance even
//! when they resolve to identical bytes.

use std::path::{Path, PathBuf};

use crate::error::ResolveError;
use crate::fetch::ContentFetcher;
use crate::manifest::IpfsConfig;

const FILE_SCHEME: &str = "file://";
const IPFS_SCHEME: &str = "IPFS://";

/// A parsed module reference. The scheme prefixes are case-sensitive as
/// written; anything else is `Bare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleReference {
    Local(PathBuf),
    ContentAddressed(String),
    Bare(String),
}

impl ModuleReference {
    pub fn parse(raw: &str) -> Self {
        if let Some(path) = raw.strip_prefix(FILE_SCHEME) {
            ModuleReference::Local(PathBuf::from(path))
        } else if let Some(cid) = raw.strip_prefix(IPFS_SCHEME) {
            ModuleReference::ContentAddressed(cid.to_string())
        } else {
            ModuleReference::Bare(raw.to_string())
        }
    }
}

/// Turns module references into byte payloads.
pub struct ModuleResolver {
    fetcher: Option<ContentFetcher>,
}

impl ModuleResolver {
    /// Build a resolver from the manifest's content-address settings. The
    /// fetcher exists only when fetching is enabled.
    pub fn from_config(config: &IpfsConfig) -> Self {
        let fetcher = config
            .enable
            .then(|| ContentFetcher::new(&config.lassie_net));
        Self { fetcher }
    }

    /// Resolver with no fetch capability; `IPFS://` references fail with
    /// [`ResolveError::FetchingDisabled`].
    pub fn local_only() -> Self {
        Self { fetcher: None }
    }

    /// Resolve a reference to one or more byte payloads. Local references
    /// yield a single payload; content-addressed bundles may carry several.
    pub async fn resolve(&self, raw: &str) -> Result<Vec<Vec<u8>>, ResolveError> {
        match ModuleReference::parse(raw) {
            ModuleReference::Local(path) => self.read_local(&path).await,
            ModuleReference::ContentAddressed(cid) => self.fetch(&cid).await,
            ModuleReference::Bare(value) => {
                let path = Path::new(&value);
                if path.exists() {
                    return self.read_local(path).await;
                }
                if self.fetcher.is_some() {
                    tracing::debug!(reference = %value, "Bare reference absent on disk, trying fetch");
                    return self.fetch(&value).await;
                }
                Err(ResolveError::NotFound(value))
            }
        }
    }

    async fn read_local(&self, path: &Path) -> Result<Vec<Vec<u8>>, ResolveError> {
        if !path.exists() {
            return Err(ResolveError::NotFound(path.display().to_string()));
        }
        tracing::debug!(path = %path.display(), "Reading module from filesystem");
        let bytes = tokio::fs::read(path).await?;
        Ok(vec![bytes])
    }

    async fn fetch(&self, cid: &str) -> Result<Vec<Vec<u8>>, ResolveError> {
        let fetcher = self.fetcher.as_ref().ok_or(ResolveError::FetchingDisabled)?;
        Ok(fetcher.retrieve(cid).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::LassieNet;

    #[test]
    fn parses_reference_forms() {
        assert_eq!(
            ModuleReference::parse("file:///tmp/a.wasm"),
            ModuleReference::Local(PathBuf::from("/tmp/a.wasm"))
        );
        assert_eq!(
            ModuleReference::parse("IPFS://bafyabc"),
            ModuleReference::ContentAddressed("bafyabc".into())
        );
        assert_eq!(
            ModuleReference::parse("./plain/path.wasm"),
            ModuleReference::Bare("./plain/path.wasm".into())
        );
        // The scheme is case-sensitive as written.
        assert_eq!(
            ModuleReference::parse("ipfs://bafyabc"),
            ModuleReference::Bare("ipfs://bafyabc".into())
        );
    }

    #[tokio::test]
    async fn resolves_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool.wasm");
        std::fs::write(&path, b"module bytes").unwrap();

        let resolver = ModuleResolver::local_only();
        let reference = format!("file://{}", path.display());
        let payloads = resolver.resolve(&reference).await.unwrap();
        assert_eq!(payloads, vec![b"module bytes".to_vec()]);
    }

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let resolver = ModuleResolver::local_only();
        let err = resolver.resolve("file:///nope/missing.wasm").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn bare_reference_resolves_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.wasm");
        std::fs::write(&path, b"bare bytes").unwrap();

        let resolver = ModuleResolver::local_only();
        let payloads = resolver.resolve(&path.display().to_string()).await.unwrap();
        assert_eq!(payloads, vec![b"bare bytes".to_vec()]);
    }

    #[tokio::test]
    async fn bare_reference_without_fetching_is_not_found() {
        let resolver = ModuleResolver::local_only();
        let err = resolver.resolve("no-such-module").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn content_reference_requires_fetching_enabled() {
        let resolver = ModuleResolver::local_only();
        let err = resolver.resolve("IPFS://bafyabc").await.unwrap_err();
        assert!(matches!(err, ResolveError::FetchingDisabled));
    }

    #[tokio::test]
    async fn fetch_failure_is_typed() {
        // Gateway on a port nobody listens on: the request itself fails.
        let config = IpfsConfig {
            enable: true,
            lassie_net: LassieNet {
                scheme: "http".into(),
                host: "127.0.0.1".into(),
                port: 9,
            },
            cids: vec![],
        };
        let resolver = ModuleResolver::from_config(&config);
        let err = resolver.resolve("IPFS://bafyabc").await.unwrap_err();
        assert!(matches!(err, ResolveError::Fetch(_)));
    }
}
