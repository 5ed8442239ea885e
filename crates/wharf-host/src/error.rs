use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Errors from the content-addressed fetch path. Each variant names the
/// stage that failed; partial results are never returned.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("gateway returned HTTP {status} for {id}")]
    Http { id: String, status: u16 },

    #[error("fetch request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("payload archive unreadable: {0}")]
    Archive(String),

    #[error("payload extraction failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("content-addressed fetching is not enabled")]
    FetchingDisabled,

    #[error("content-addressed fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("module read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("no loadable WASM module at {reference}: {message}")]
    InvalidModule { reference: String, message: String },

    #[error("instantiation failed for {reference}: {message}")]
    Instantiation { reference: String, message: String },

    #[error("module not loaded: {0}")]
    ModuleNotLoaded(String),

    #[error("function {function} is not exported by {reference}")]
    FunctionMissing { reference: String, function: String },

    #[error("guest call failed: {0}")]
    Call(String),

    #[error("call deadline elapsed")]
    Timeout,

    #[error("registry is shutting down")]
    Shutdown,
}

impl RegistryError {
    /// Stable machine-readable code, surfaced alongside the human-readable
    /// message in HTTP error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Resolve(_) => "resolve_failed",
            RegistryError::InvalidModule { .. } => "invalid_module",
            RegistryError::Instantiation { .. } => "instantiation_failed",
            RegistryError::ModuleNotLoaded(_) => "module_not_loaded",
            RegistryError::FunctionMissing { .. } => "function_missing",
            RegistryError::Call(_) => "call_failed",
            RegistryError::Timeout => "timeout",
            RegistryError::Shutdown => "shutting_down",
        }
    }
}
