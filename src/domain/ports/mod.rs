mod codec_port;
mod fetcher_port;
mod listener_port;

pub use codec_port::{BufferSource, ImageCodec, ImageTransform};
pub use fetcher_port::{FetchObserver, NoopObserver, SourceFetcher};
pub use listener_port::{Delivered, DownloadResult, NoopListener, RequestListener};

#[cfg(test)]
pub use codec_port::{MockImageCodec, MockImageTransform};
