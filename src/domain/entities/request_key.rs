//! Canonical request keys.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::options::RequestOptions;
use super::uri::{UriDescriptor, UriScheme};

/// Identifies an identifier + options combination.
///
/// Two requests with equal keys produce the same decoded resource and are
/// interchangeable for caching and coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(Arc<str>);

impl RequestKey {
    /// Builds the key for a decode request.
    ///
    /// The source part is length-prefixed (`<len>:<source><fields>`), so an
    /// identifier that happens to end in option-like text never yields the
    /// key of another identifier plus options.
    #[must_use]
    pub fn new(uri: &UriDescriptor, options: &RequestOptions) -> Self {
        let source = source_part(uri);
        let mut key = format!("{}:{source}", source.len());
        options.write_key_fields(&mut key);
        Self(key.into())
    }

    /// Builds the key identifying raw source bytes, independent of options.
    ///
    /// Used by the disk cache and the per-identifier download lock.
    #[must_use]
    pub fn source(uri: &UriDescriptor) -> Self {
        Self(source_part(uri).into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digest of the key, safe for use as a file name.
    #[must_use]
    pub fn digest(&self) -> String {
        hash_hex(self.0.as_bytes())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

fn source_part(uri: &UriDescriptor) -> String {
    match uri.scheme() {
        // Inline payloads are hashed so keys stay short.
        UriScheme::Inline => format!("inline:{}", hash_hex(uri.content().as_bytes())),
        _ => uri.as_str().to_string(),
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{DecodeQuality, RequestLevel, ScaleMode};
    use crate::domain::ports::MockImageTransform;

    fn uri(s: &str) -> UriDescriptor {
        UriDescriptor::parse(s).unwrap()
    }

    #[test]
    fn test_same_inputs_same_key() {
        let a = RequestKey::new(&uri("https://x/img.png"), &RequestOptions::new().max_size(200, 200));
        let b = RequestKey::new(&uri("https://x/img.png"), &RequestOptions::new().max_size(200, 200));
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_relevant_fields_change_key() {
        let u = uri("https://x/img.png");
        let base = RequestKey::new(&u, &RequestOptions::new());
        let sized = RequestKey::new(&u, &RequestOptions::new().max_size(10, 10));
        let resized = RequestKey::new(&u, &RequestOptions::new().resize(10, 10, ScaleMode::Fit));
        let low = RequestKey::new(&u, &RequestOptions::new().decode_quality(DecodeQuality::Low));

        assert_ne!(base, sized);
        assert_ne!(base, resized);
        assert_ne!(base, low);
        assert_ne!(sized, resized);
    }

    #[test]
    fn test_policy_fields_do_not_change_key() {
        let u = uri("https://x/img.png");
        let base = RequestKey::new(&u, &RequestOptions::new());
        let policy = RequestKey::new(
            &u,
            &RequestOptions::new()
                .disable_disk_cache(true)
                .request_level(RequestLevel::Local),
        );
        assert_eq!(base, policy);
    }

    #[test]
    fn test_inline_key_is_hashed() {
        let key = RequestKey::source(&uri("data:image/png;base64,QUJDRA=="));
        assert!(key.as_str().starts_with("inline:"));
        assert_eq!(key.as_str().len(), "inline:".len() + 32);
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let key = RequestKey::from("https://x/img.png");
        assert_eq!(key.digest(), key.digest());
        assert_eq!(key.digest().len(), 32);
        assert!(key.digest().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_option_suffix_in_identifier_does_not_collide() {
        let suffixed = RequestKey::new(
            &uri("https://img.example/cat.png_max(16x16)"),
            &RequestOptions::new(),
        );
        let sized = RequestKey::new(
            &uri("https://img.example/cat.png"),
            &RequestOptions::new().max_size(16, 16),
        );
        assert_ne!(suffixed, sized);

        let low = RequestKey::new(&uri("https://x/a.png_lq"), &RequestOptions::new());
        let lq = RequestKey::new(
            &uri("https://x/a.png"),
            &RequestOptions::new().decode_quality(DecodeQuality::Low),
        );
        assert_ne!(low, lq);
    }

    #[test]
    fn test_decode_key_embeds_source() {
        let u = uri("https://x/img.png");
        let key = RequestKey::new(&u, &RequestOptions::new());
        assert_eq!(key.as_str(), "17:https://x/img.png");
        assert_ne!(key, RequestKey::source(&u));
    }

    fn transform(identity: &'static str) -> Arc<MockImageTransform> {
        let mut transform = MockImageTransform::new();
        transform.expect_identity().return_const(identity.to_string());
        Arc::new(transform)
    }

    #[test]
    fn test_transform_identity_changes_key() {
        let u = uri("https://x/img.png");
        let base = RequestKey::new(&u, &RequestOptions::new());
        let round = RequestKey::new(&u, &RequestOptions::new().transform(transform("round")));
        let round_again = RequestKey::new(&u, &RequestOptions::new().transform(transform("round")));
        let blur = RequestKey::new(&u, &RequestOptions::new().transform(transform("blur")));

        assert_ne!(base, round);
        assert_eq!(round, round_again);
        assert_ne!(round, blur);
    }
}
