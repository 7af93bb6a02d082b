//! Per-request options.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::ports::ImageTransform;

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Creates a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Returns true if `other` fits entirely inside `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
        let width = w.trim().parse().map_err(|e| format!("bad width: {e}"))?;
        let height = h.trim().parse().map_err(|e| format!("bad height: {e}"))?;
        Ok(Self::new(width, height))
    }
}

/// How a resize target is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    /// Scale down until the image fits inside the target.
    #[default]
    Fit,
    /// Scale to cover the target, cropping the overflow.
    Fill,
    /// Stretch to the exact target.
    Exact,
}

impl ScaleMode {
    const fn tag(self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::Fill => "fill",
            Self::Exact => "exact",
        }
    }
}

/// Resize target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resize {
    /// Target dimensions.
    pub size: Size,
    /// Scaling strategy.
    pub mode: ScaleMode,
}

/// Decode quality trade-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeQuality {
    /// Cheaper filter and a 16-bit pixel format.
    Low,
    /// Best filter and 32-bit pixels.
    #[default]
    High,
}

/// How far a request may reach to satisfy itself.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RequestLevel {
    /// Memory cache only.
    Memory,
    /// Memory cache, disk cache and local sources; never the network.
    Local,
    /// Everything.
    #[default]
    Network,
}

impl RequestLevel {
    /// Returns true if network fetches are allowed.
    #[must_use]
    pub const fn allows_network(self) -> bool {
        matches!(self, Self::Network)
    }

    /// Returns true if decoding is allowed.
    #[must_use]
    pub const fn allows_decode(self) -> bool {
        !matches!(self, Self::Memory)
    }
}

impl fmt::Display for RequestLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Local => write!(f, "local"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Options captured by a request at submission.
///
/// Submission takes the options by value, so later changes on the caller's
/// side never reach an in-flight request.
#[derive(Clone, Default)]
pub struct RequestOptions {
    max_size: Option<Size>,
    resize: Option<Resize>,
    force_exact_resize: bool,
    decode_quality: DecodeQuality,
    memory_cache_disabled: bool,
    disk_cache_disabled: bool,
    request_level: RequestLevel,
    transform: Option<Arc<dyn ImageTransform>>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("max_size", &self.max_size)
            .field("resize", &self.resize)
            .field("force_exact_resize", &self.force_exact_resize)
            .field("decode_quality", &self.decode_quality)
            .field("memory_cache_disabled", &self.memory_cache_disabled)
            .field("disk_cache_disabled", &self.disk_cache_disabled)
            .field("request_level", &self.request_level)
            .field("transform", &self.transform_identity())
            .finish()
    }
}

impl RequestOptions {
    /// Creates default options: no size limits, high quality, all caches,
    /// network level.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps decoded dimensions.
    #[must_use]
    pub const fn max_size(mut self, width: u32, height: u32) -> Self {
        self.max_size = Some(Size::new(width, height));
        self
    }

    /// Resizes the decoded image to a target.
    #[must_use]
    pub const fn resize(mut self, width: u32, height: u32, mode: ScaleMode) -> Self {
        self.resize = Some(Resize {
            size: Size::new(width, height),
            mode,
        });
        self
    }

    /// Forces the output to exactly match the resize target even when the
    /// source is smaller.
    #[must_use]
    pub const fn force_exact_resize(mut self, force: bool) -> Self {
        self.force_exact_resize = force;
        self
    }

    /// Sets decode quality.
    #[must_use]
    pub const fn decode_quality(mut self, quality: DecodeQuality) -> Self {
        self.decode_quality = quality;
        self
    }

    /// Bypasses the memory cache (no lookup, no store, no free ride).
    #[must_use]
    pub const fn disable_memory_cache(mut self, disabled: bool) -> Self {
        self.memory_cache_disabled = disabled;
        self
    }

    /// Bypasses the disk cache.
    #[must_use]
    pub const fn disable_disk_cache(mut self, disabled: bool) -> Self {
        self.disk_cache_disabled = disabled;
        self
    }

    /// Caps how far the request may reach.
    #[must_use]
    pub const fn request_level(mut self, level: RequestLevel) -> Self {
        self.request_level = level;
        self
    }

    /// Applies a post-decode transform.
    #[must_use]
    pub fn transform(mut self, transform: Arc<dyn ImageTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Max decoded size, if any.
    #[must_use]
    pub const fn max_size_limit(&self) -> Option<Size> {
        self.max_size
    }

    /// Resize target, if any.
    #[must_use]
    pub const fn resize_target(&self) -> Option<Resize> {
        self.resize
    }

    /// Whether an exact resize is forced.
    #[must_use]
    pub const fn is_force_exact_resize(&self) -> bool {
        self.force_exact_resize
    }

    /// The decode quality.
    #[must_use]
    pub const fn quality(&self) -> DecodeQuality {
        self.decode_quality
    }

    /// Whether the memory cache may be used.
    #[must_use]
    pub const fn allows_memory_cache(&self) -> bool {
        !self.memory_cache_disabled
    }

    /// Whether the disk cache may be used.
    #[must_use]
    pub const fn allows_disk_cache(&self) -> bool {
        !self.disk_cache_disabled
    }

    /// The request level.
    #[must_use]
    pub const fn level(&self) -> RequestLevel {
        self.request_level
    }

    /// The transform, if any.
    #[must_use]
    pub fn transformer(&self) -> Option<&Arc<dyn ImageTransform>> {
        self.transform.as_ref()
    }

    /// Stable identity of the transform, if any.
    #[must_use]
    pub fn transform_identity(&self) -> Option<String> {
        self.transform.as_ref().map(|t| t.identity())
    }

    /// Appends the cache-relevant fields to `out` in a fixed order.
    ///
    /// Listener references, cache switches and the request level never
    /// change the decoded result and are left out.
    pub(crate) fn write_key_fields(&self, out: &mut String) {
        use std::fmt::Write;

        if let Some(max) = self.max_size {
            let _ = write!(out, "_max({max})");
        }
        if let Some(resize) = self.resize {
            let _ = write!(out, "_resize({},{})", resize.size, resize.mode.tag());
            if self.force_exact_resize {
                out.push_str("_exact");
            }
        }
        if self.decode_quality == DecodeQuality::Low {
            out.push_str("_lq");
        }
        if let Some(identity) = self.transform_identity() {
            let _ = write!(out, "_tf({identity})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RequestOptions::new();
        assert!(options.allows_memory_cache());
        assert!(options.allows_disk_cache());
        assert_eq!(options.level(), RequestLevel::Network);
        assert_eq!(options.quality(), DecodeQuality::High);
        assert!(options.max_size_limit().is_none());
    }

    #[test]
    fn test_level_ordering() {
        assert!(RequestLevel::Memory < RequestLevel::Local);
        assert!(RequestLevel::Local < RequestLevel::Network);
        assert!(!RequestLevel::Local.allows_network());
        assert!(RequestLevel::Local.allows_decode());
        assert!(!RequestLevel::Memory.allows_decode());
    }

    #[test]
    fn test_size_parse() {
        assert_eq!("200x100".parse::<Size>(), Ok(Size::new(200, 100)));
        assert!("200".parse::<Size>().is_err());
        assert!("ax1".parse::<Size>().is_err());
    }

    #[test]
    fn test_exact_flag_only_counts_with_resize() {
        let mut plain = String::new();
        RequestOptions::new()
            .force_exact_resize(true)
            .write_key_fields(&mut plain);
        assert!(plain.is_empty());

        let mut resized = String::new();
        RequestOptions::new()
            .resize(10, 10, ScaleMode::Fill)
            .force_exact_resize(true)
            .write_key_fields(&mut resized);
        assert_eq!(resized, "_resize(10x10,fill)_exact");
    }
}
