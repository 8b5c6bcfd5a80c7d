//! Thread identification for scope filtering.
//!
//! `std::thread::ThreadId` has no stable numeric form, so every thread that
//! touches the instrumentation gets a process-unique `u64` on first use.

use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadMeta = ThreadMeta::capture();
}

/// Identity of a thread that performed I/O.
///
/// Equality and hashing only look at `id`; the name is informational.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadMeta {
    id: u64,
    name: Option<Arc<str>>,
}

impl ThreadMeta {
    fn capture() -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name: std::thread::current().name().map(Arc::from),
        }
    }

    /// Metadata of the calling thread.
    pub fn current() -> Self {
        CURRENT.with(|meta| meta.clone())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_current(&self) -> bool {
        CURRENT.with(|meta| meta.id == self.id)
    }
}

impl PartialEq for ThreadMeta {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadMeta {}

impl Hash for ThreadMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for ThreadMeta {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ThreadMeta {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for ThreadMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} (#{})", name, self.id),
            None => write!(f, "#{}", self.id),
        }
    }
}

/// Which threads an expectation or query looks at, relative to the thread
/// that opened the observation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ThreadScope {
    #[default]
    Current,
    Others,
    Any,
}

impl ThreadScope {
    pub fn matches(self, owner: &ThreadMeta, creator: &ThreadMeta) -> bool {
        match self {
            ThreadScope::Current => owner == creator,
            ThreadScope::Others => owner != creator,
            ThreadScope::Any => true,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ThreadScope::Current => "current thread",
            ThreadScope::Others => "other threads",
            ThreadScope::Any => "all threads",
        }
    }
}
