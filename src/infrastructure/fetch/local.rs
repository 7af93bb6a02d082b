//! Fetcher for on-device sources: files, bundled assets, content-provider
//! references and application resources.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::domain::entities::{UriDescriptor, UriScheme};
use crate::domain::errors::FetchError;
use crate::domain::ports::{FetchObserver, SourceFetcher};

/// Reads local identifiers from disk.
///
/// Assets resolve under `asset_root`, content references under
/// `content_root`, and resource ids through a lookup table of paths.
#[derive(Debug, Clone, Default)]
pub struct LocalFetcher {
    asset_root: Option<PathBuf>,
    content_root: Option<PathBuf>,
    resources: HashMap<String, PathBuf>,
}

impl LocalFetcher {
    /// Creates a fetcher that only serves absolute file paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory bundled assets are read from.
    #[must_use]
    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = Some(root.into());
        self
    }

    /// Sets the directory content-provider references resolve under.
    #[must_use]
    pub fn with_content_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.content_root = Some(root.into());
        self
    }

    /// Registers a resource id.
    #[must_use]
    pub fn with_resource(mut self, id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.resources.insert(id.into(), path.into());
        self
    }

    /// Loads resource ids from a TOML table of `id = "path"` pairs.
    ///
    /// Relative paths resolve against the asset root.
    ///
    /// # Errors
    /// Returns error if the table cannot be read or parsed.
    pub fn load_resource_table(mut self, path: &Path) -> Result<Self, FetchError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FetchError::io(format!("Failed to read resource table: {e}")))?;
        let table: HashMap<String, PathBuf> = toml::from_str(&content)
            .map_err(|e| FetchError::io(format!("Failed to parse resource table: {e}")))?;
        debug!(path = %path.display(), count = table.len(), "Loaded resource table");
        self.resources.extend(table);
        Ok(self)
    }

    fn resolve(&self, uri: &UriDescriptor) -> Result<PathBuf, FetchError> {
        let not_found = || FetchError::NotFound {
            path: uri.to_string(),
        };
        match uri.scheme() {
            UriScheme::File => Ok(PathBuf::from(uri.content())),
            UriScheme::Asset => {
                let root = self.asset_root.as_ref().ok_or_else(not_found)?;
                join_within(root, uri.content()).ok_or_else(not_found)
            }
            UriScheme::Content => {
                let root = self.content_root.as_ref().ok_or_else(not_found)?;
                join_within(root, uri.content()).ok_or_else(not_found)
            }
            UriScheme::Resource => {
                let path = self.resources.get(uri.content()).ok_or_else(not_found)?;
                match &self.asset_root {
                    Some(root) if path.is_relative() => Ok(root.join(path)),
                    _ => Ok(path.clone()),
                }
            }
            other => Err(FetchError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

/// Joins `relative` onto `root`, refusing anything that escapes it.
fn join_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    safe.then(|| root.join(relative))
}

#[async_trait]
impl SourceFetcher for LocalFetcher {
    fn supports(&self, scheme: UriScheme) -> bool {
        matches!(
            scheme,
            UriScheme::File | UriScheme::Asset | UriScheme::Content | UriScheme::Resource
        )
    }

    async fn fetch(
        &self,
        uri: &UriDescriptor,
        observer: &dyn FetchObserver,
    ) -> Result<Bytes, FetchError> {
        let path = self.resolve(uri)?;
        if observer.is_canceled() {
            return Err(FetchError::Canceled);
        }

        trace!(path = %path.display(), "Reading local source");
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FetchError::NotFound {
                    path: path.display().to_string(),
                }
            } else {
                FetchError::io(format!("Failed to read {}: {e}", path.display()))
            }
        })?;

        let len = bytes.len() as u64;
        observer.on_progress(len, len);
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::NoopObserver;
    use tempfile::TempDir;
    use test_case::test_case;

    fn setup() -> (TempDir, LocalFetcher) {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("assets/icons")).unwrap();
        std::fs::create_dir_all(temp.path().join("content/media")).unwrap();
        std::fs::write(temp.path().join("assets/icons/star.png"), b"star").unwrap();
        std::fs::write(temp.path().join("content/media/42"), b"media").unwrap();
        std::fs::write(temp.path().join("plain.png"), b"plain").unwrap();

        let fetcher = LocalFetcher::new()
            .with_asset_root(temp.path().join("assets"))
            .with_content_root(temp.path().join("content"))
            .with_resource("7", "icons/star.png");
        (temp, fetcher)
    }

    async fn fetch(fetcher: &LocalFetcher, identifier: &str) -> Result<Bytes, FetchError> {
        let uri = UriDescriptor::parse(identifier).unwrap();
        fetcher.fetch(&uri, &NoopObserver).await
    }

    #[tokio::test]
    async fn test_reads_absolute_file() {
        let (temp, fetcher) = setup();
        let id = temp.path().join("plain.png").display().to_string();
        assert_eq!(&fetch(&fetcher, &id).await.unwrap()[..], b"plain");

        let file_uri = format!("file://{id}");
        assert_eq!(&fetch(&fetcher, &file_uri).await.unwrap()[..], b"plain");
    }

    #[test_case("asset://icons/star.png", b"star" ; "asset")]
    #[test_case("content://media/42", b"media" ; "content")]
    #[test_case("drawable://7", b"star" ; "resource")]
    #[tokio::test]
    async fn test_resolves_roots(identifier: &str, expected: &[u8]) {
        let (_temp, fetcher) = setup();
        assert_eq!(&fetch(&fetcher, identifier).await.unwrap()[..], expected);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let (_temp, fetcher) = setup();
        let err = fetch(&fetcher, "asset://icons/missing.png").await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_asset_cannot_escape_root() {
        let (_temp, fetcher) = setup();
        let err = fetch(&fetcher, "asset://../plain.png").await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_resource_id() {
        let (_temp, fetcher) = setup();
        let err = fetch(&fetcher, "drawable://99").await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[test]
    fn test_resource_table_from_toml() {
        let temp = TempDir::new().unwrap();
        let table = temp.path().join("resources.toml");
        std::fs::write(&table, "logo = \"brand/logo.png\"\n").unwrap();

        let fetcher = LocalFetcher::new().load_resource_table(&table).unwrap();
        assert_eq!(
            fetcher.resources.get("logo"),
            Some(&PathBuf::from("brand/logo.png"))
        );
    }

    #[test]
    fn test_does_not_claim_network() {
        assert!(!LocalFetcher::new().supports(UriScheme::Network));
        assert!(!LocalFetcher::new().supports(UriScheme::Inline));
    }
}
