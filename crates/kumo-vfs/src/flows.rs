//! FlowBus pub/sub for VFS events.
//!
//! Mount lifecycle changes and successful mutations are published here.
//! Subscribers use NATS-style subject patterns to filter events of interest.
//!
//! # Pattern Matching
//!
//! Patterns use dot-separated tokens with wildcards:
//! - `*` matches exactly one token: `vfs.*` matches `vfs.mount`
//! - `>` matches one or more tokens (only at end)
//! - Exact match: `vfs.unmount` only matches `vfs.unmount`
//!
//! # Example
//!
//! ```ignore
//! let bus = FlowBus::<VfsFlow>::new(256);
//! let mut sub = bus.subscribe("vfs.mount");
//! bus.publish(VfsFlow::Mounted { module: "home".into() });
//! while let Some(msg) = sub.recv().await {
//!     println!("{} from {:?}", msg.subject, msg.sender);
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::vfs::FileMetadata;

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
///
/// Patterns use NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens (only at end)
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => {
                // `>` must be at the end and matches one or more remaining tokens
                return pi == pattern_tokens.len() - 1 && si < subject_tokens.len();
            }
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Flow Message Types
// ============================================================================

/// Trait for payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &str;
}

/// A message published to the flow bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    /// The subject (derived from payload).
    pub subject: String,
    pub payload: T,
    /// When this message was created.
    pub timestamp: Instant,
    /// The caller that triggered the event, if it identified itself.
    pub sender: Option<String>,
}

impl<T: HasSubject> FlowMessage<T> {
    pub fn new(payload: T, sender: Option<String>) -> Self {
        let subject = payload.subject().to_string();
        Self {
            subject,
            payload,
            timestamp: Instant::now(),
            sender,
        }
    }
}

// ============================================================================
// VFS Flow Events
// ============================================================================

/// VFS events.
#[derive(Clone, Debug, PartialEq)]
pub enum VfsFlow {
    /// A mount point became mounted.
    Mounted { module: String },
    /// A mount point was unmounted.
    Unmounted { module: String },
    /// A file was written.
    Written { file: FileMetadata },
    /// A file was uploaded.
    Uploaded { file: FileMetadata },
    /// A directory was created.
    DirCreated { dir: FileMetadata },
    /// An entry was removed.
    Unlinked { file: FileMetadata },
    /// An entry was copied.
    Copied {
        source: FileMetadata,
        destination: FileMetadata,
    },
    /// An entry was moved.
    Moved {
        source: FileMetadata,
        destination: FileMetadata,
    },
}

impl VfsFlow {
    pub fn subject(&self) -> &'static str {
        match self {
            VfsFlow::Mounted { .. } => "vfs.mount",
            VfsFlow::Unmounted { .. } => "vfs.unmount",
            VfsFlow::Written { .. } => "vfs.write",
            VfsFlow::Uploaded { .. } => "vfs.upload",
            VfsFlow::DirCreated { .. } => "vfs.mkdir",
            VfsFlow::Unlinked { .. } => "vfs.unlink",
            VfsFlow::Copied { .. } => "vfs.copy",
            VfsFlow::Moved { .. } => "vfs.move",
        }
    }

    /// The mount point name for lifecycle events.
    pub fn module(&self) -> Option<&str> {
        match self {
            VfsFlow::Mounted { module } | VfsFlow::Unmounted { module } => Some(module),
            _ => None,
        }
    }
}

impl HasSubject for VfsFlow {
    fn subject(&self) -> &str {
        VfsFlow::subject(self)
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Type-parameterized pub/sub bus for a specific flow domain.
///
/// Uses a broadcast channel internally for multi-subscriber delivery.
/// Subscribers receive only messages matching their pattern.
#[derive(Debug)]
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    /// Create a new flow bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload to the bus.
    ///
    /// Returns the number of subscribers that received the message.
    pub fn publish(&self, payload: T) -> usize {
        self.tx.send(FlowMessage::new(payload, None)).unwrap_or(0)
    }

    /// Publish a payload with sender information.
    pub fn publish_from(&self, payload: T, sender: Option<String>) -> usize {
        self.tx.send(FlowMessage::new(payload, sender)).unwrap_or(0)
    }

    /// Subscribe to messages matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A subscription to a FlowBus with pattern filtering.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message, waiting if necessary.
    ///
    /// Returns None if the channel is closed.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }

    /// Try to receive the next matching message without blocking.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        lagged = n,
                        "Flow subscription lagged behind"
                    );
                }
            }
        }
    }
}

/// Shared VFS flow bus.
pub type SharedVfsFlowBus = Arc<FlowBus<VfsFlow>>;

/// Create a shared VFS flow bus.
pub fn shared_vfs_flow_bus(capacity: usize) -> SharedVfsFlowBus {
    Arc::new(FlowBus::new(capacity))
}
