//! Identifier classification.
//!
//! Every identifier handed to the engine is parsed exactly once into a
//! [`UriDescriptor`]. The descriptor is immutable and shared by every stage of
//! the request that captured it.

use std::fmt;

/// Literal prefix marking an inline base64 image payload.
pub const INLINE_PREFIX: &str = "data:image/";

/// Marker separating the inline media type from the encoded payload.
const INLINE_BASE64_MARKER: &str = ";base64,";

/// Where the bytes for an identifier come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UriScheme {
    /// `http://` or `https://`.
    Network,
    /// `/absolute/path` or `file://`.
    File,
    /// `content://` provider reference.
    Content,
    /// `asset://` bundled asset.
    Asset,
    /// `drawable://` application resource id.
    Resource,
    /// `data:image/...;base64,` inline payload.
    Inline,
}

impl UriScheme {
    /// Returns true when fetching requires the network stage.
    #[must_use]
    pub const fn is_network(self) -> bool {
        matches!(self, Self::Network)
    }

    /// Returns true when raw bytes are worth persisting in the disk cache.
    #[must_use]
    pub const fn uses_disk_cache(self) -> bool {
        matches!(self, Self::Network)
    }

    /// Short tag used in request keys and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::File => "file",
            Self::Content => "content",
            Self::Asset => "asset",
            Self::Resource => "resource",
            Self::Inline => "inline",
        }
    }
}

impl fmt::Display for UriScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified identifier.
///
/// `content` is the scheme-stripped part, except for network identifiers
/// where the transport needs the full URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UriDescriptor {
    scheme: UriScheme,
    content: String,
    original: String,
}

impl UriDescriptor {
    /// Classifies `identifier`.
    ///
    /// Returns `None` for empty identifiers and for unrecognized schemes.
    #[must_use]
    pub fn parse(identifier: &str) -> Option<Self> {
        let trimmed = identifier.trim();
        if trimmed.is_empty() {
            return None;
        }

        let (scheme, content) = classify(trimmed)?;
        if content.is_empty() {
            return None;
        }

        Some(Self {
            scheme,
            content: content.to_string(),
            original: trimmed.to_string(),
        })
    }

    /// The scheme tag.
    #[must_use]
    pub const fn scheme(&self) -> UriScheme {
        self.scheme
    }

    /// The scheme-stripped content.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The identifier exactly as submitted, minus surrounding whitespace.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Media type declared by an inline payload, e.g. `image/png`.
    #[must_use]
    pub fn inline_media_type(&self) -> Option<&str> {
        if self.scheme != UriScheme::Inline {
            return None;
        }
        let rest = self.original.strip_prefix("data:")?;
        rest.find(INLINE_BASE64_MARKER).map(|idx| &rest[..idx])
    }
}

impl fmt::Display for UriDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == UriScheme::Inline {
            // Inline payloads can be megabytes long.
            write!(f, "data:{}...", self.inline_media_type().unwrap_or("image/*"))
        } else {
            f.write_str(&self.original)
        }
    }
}

fn classify(identifier: &str) -> Option<(UriScheme, &str)> {
    if identifier.starts_with("http://") || identifier.starts_with("https://") {
        return Some((UriScheme::Network, identifier));
    }
    if identifier.starts_with('/') {
        return Some((UriScheme::File, identifier));
    }
    if let Some(path) = identifier.strip_prefix("file://") {
        return Some((UriScheme::File, path));
    }
    if let Some(rest) = identifier.strip_prefix("content://") {
        return Some((UriScheme::Content, rest));
    }
    if let Some(rest) = identifier.strip_prefix("asset://") {
        return Some((UriScheme::Asset, rest));
    }
    if let Some(rest) = identifier.strip_prefix("drawable://") {
        return Some((UriScheme::Resource, rest));
    }
    if identifier.starts_with(INLINE_PREFIX) {
        let idx = identifier.find(INLINE_BASE64_MARKER)?;
        return Some((UriScheme::Inline, &identifier[idx + INLINE_BASE64_MARKER.len()..]));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("http://x/img.png", UriScheme::Network, "http://x/img.png" ; "http")]
    #[test_case("https://x/img.png", UriScheme::Network, "https://x/img.png" ; "https")]
    #[test_case("/sdcard/a.jpg", UriScheme::File, "/sdcard/a.jpg" ; "absolute_path")]
    #[test_case("file:///sdcard/a.jpg", UriScheme::File, "/sdcard/a.jpg" ; "file_uri")]
    #[test_case("content://media/42", UriScheme::Content, "media/42" ; "content")]
    #[test_case("asset://icons/star.png", UriScheme::Asset, "icons/star.png" ; "asset")]
    #[test_case("drawable://1234", UriScheme::Resource, "1234" ; "drawable")]
    #[test_case("data:image/png;base64,iVBORw0K", UriScheme::Inline, "iVBORw0K" ; "inline")]
    fn test_classify(identifier: &str, scheme: UriScheme, content: &str) {
        let uri = UriDescriptor::parse(identifier).unwrap();
        assert_eq!(uri.scheme(), scheme);
        assert_eq!(uri.content(), content);
    }

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    #[test_case("ftp://x/img.png" ; "unsupported")]
    #[test_case("asset://" ; "no_content")]
    #[test_case("data:image/png,raw" ; "inline_without_base64")]
    fn test_rejected(identifier: &str) {
        assert!(UriDescriptor::parse(identifier).is_none());
    }

    #[test]
    fn test_inline_media_type() {
        let uri = UriDescriptor::parse("data:image/webp;base64,AAAA").unwrap();
        assert_eq!(uri.inline_media_type(), Some("image/webp"));
        assert_eq!(uri.to_string(), "data:image/webp...");
    }

    #[test]
    fn test_only_network_uses_disk_cache() {
        assert!(UriScheme::Network.uses_disk_cache());
        assert!(!UriScheme::File.uses_disk_cache());
        assert!(!UriScheme::Inline.is_network());
    }
}
