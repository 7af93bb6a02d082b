//! Request lifecycle states.

use std::fmt;

use crate::domain::errors::{CancelCause, FailCause};

/// The flavor of a request, deciding how far the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Fetch raw bytes into the disk cache only.
    Download,
    /// Fetch and decode into a resource.
    Load,
    /// Load, then hand the resource to a display target.
    Display,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => write!(f, "download"),
            Self::Load => write!(f, "load"),
            Self::Display => write!(f, "display"),
        }
    }
}

/// Where a delivered result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// In-memory decoded cache.
    MemoryCache,
    /// On-disk raw byte cache.
    DiskCache,
    /// Downloaded from the network.
    Network,
    /// Read from a local source (file, asset, content, resource, inline).
    Local,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Request state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// Built, not yet submitted.
    Created,
    /// Key computed, looking for the cheapest way to satisfy the request.
    Dispatching,
    /// Probing the disk cache.
    CheckingDiskCache,
    /// Fetching bytes from the network.
    Downloading,
    /// Turning bytes into a resource.
    Decoding,
    /// Result ready, waiting for the delivery context.
    AwaitingDelivery,
    /// Handed to a display target, waiting for it to take the resource.
    AwaitingRender,
    /// Delivered.
    Completed,
    /// Broken.
    Failed(FailCause),
    /// Given up.
    Canceled(CancelCause),
}

impl RequestState {
    /// Returns true for `Completed`, `Failed` and `Canceled`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Canceled(_))
    }

    /// Returns whether the machine may move from `self` to `next` for a
    /// request of `kind`.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self, kind: RequestKind) -> bool {
        use RequestState::{
            AwaitingDelivery, AwaitingRender, Canceled, CheckingDiskCache, Completed, Created,
            Decoding, Dispatching, Downloading, Failed,
        };

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed(_) | Canceled(_)) {
            return true;
        }

        match (self, next) {
            (Created, Dispatching)
            | (Dispatching, CheckingDiskCache | Downloading | AwaitingDelivery)
            | (CheckingDiskCache, Downloading | AwaitingDelivery)
            | (Decoding, AwaitingDelivery) => true,
            (Dispatching | CheckingDiskCache | Downloading, Decoding) => {
                kind != RequestKind::Download
            }
            (Downloading, AwaitingDelivery) => kind == RequestKind::Download,
            (AwaitingDelivery, AwaitingRender) | (AwaitingRender, Completed) => {
                kind == RequestKind::Display
            }
            (AwaitingDelivery, Completed) => kind != RequestKind::Display,
            _ => false,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Dispatching => "dispatching",
            Self::CheckingDiskCache => "checking_disk_cache",
            Self::Downloading => "downloading",
            Self::Decoding => "decoding",
            Self::AwaitingDelivery => "awaiting_delivery",
            Self::AwaitingRender => "awaiting_render",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Canceled(_) => "canceled",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(cause) => write!(f, "failed({cause})"),
            Self::Canceled(cause) => write!(f, "canceled({cause})"),
            other => f.write_str(other.name()),
        }
    }
}
