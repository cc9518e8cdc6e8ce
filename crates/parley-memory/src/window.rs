//! Fast tier: the last few messages of each session with a sliding expiry.
//!
//! It is a cache. Anything here can be rebuilt from the chat store.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_config::MemoryConfig;
use parley_core::Message;

use crate::error::MemoryResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub sessions: usize,
    pub messages: usize,
}

/// Bounded per-session message window.
#[async_trait]
pub trait RecentWindowStore: Send + Sync {
    /// Append, trim to capacity and reset the expiry as one step.
    /// Returns the window length afterwards.
    async fn push(&self, session_id: &str, message: Message) -> MemoryResult<usize>;

    /// Live window, oldest first. Expired windows read as empty.
    async fn get(&self, session_id: &str) -> MemoryResult<Vec<Message>>;

    async fn clear(&self, session_id: &str) -> MemoryResult<()>;

    async fn is_empty(&self, session_id: &str) -> MemoryResult<bool> {
        Ok(self.get(session_id).await?.is_empty())
    }

    /// Fill an empty window with `messages`. Returns false, leaving the
    /// window untouched, when it already holds live entries.
    async fn restore(&self, session_id: &str, messages: Vec<Message>) -> MemoryResult<bool>;

    /// Drop expired windows, returning how many were removed.
    async fn purge_expired(&self) -> MemoryResult<usize>;

    async fn stats(&self) -> MemoryResult<WindowStats>;
}

#[derive(Debug)]
struct Window {
    messages: VecDeque<Message>,
    expires_at: Instant,
}

impl Window {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// DashMap-backed window. Every mutation runs under the entry's shard lock.
#[derive(Debug)]
pub struct InMemoryRecentWindow {
    windows: DashMap<String, Window>,
    capacity: usize,
    ttl: Duration,
}

impl Default for InMemoryRecentWindow {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}

impl InMemoryRecentWindow {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.window_size, Duration::from_secs(config.window_ttl_secs))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn trim(&self, messages: &mut VecDeque<Message>) {
        while messages.len() > self.capacity {
            messages.pop_front();
        }
    }
}

#[async_trait]
impl RecentWindowStore for InMemoryRecentWindow {
    async fn push(&self, session_id: &str, message: Message) -> MemoryResult<usize> {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(session_id.to_string())
            .or_insert_with(|| Window {
                messages: VecDeque::with_capacity(self.capacity + 1),
                expires_at: now,
            });

        if window.is_expired(now) {
            window.messages.clear();
        }
        window.messages.push_back(message);
        self.trim(&mut window.messages);
        window.expires_at = now + self.ttl;

        Ok(window.messages.len())
    }

    async fn get(&self, session_id: &str) -> MemoryResult<Vec<Message>> {
        let now = Instant::now();
        if let Some(window) = self.windows.get(session_id) {
            if !window.is_expired(now) {
                return Ok(window.messages.iter().cloned().collect());
            }
        } else {
            return Ok(Vec::new());
        }

        self.windows.remove_if(session_id, |_, w| w.is_expired(now));
        Ok(Vec::new())
    }

    async fn clear(&self, session_id: &str) -> MemoryResult<()> {
        self.windows.remove(session_id);
        Ok(())
    }

    async fn restore(&self, session_id: &str, messages: Vec<Message>) -> MemoryResult<bool> {
        if messages.is_empty() {
            return Ok(false);
        }

        let now = Instant::now();
        let mut restored: VecDeque<Message> = messages.into_iter().collect();
        self.trim(&mut restored);

        match self.windows.entry(session_id.to_string()) {
            Entry::Occupied(mut slot) => {
                let window = slot.get_mut();
                if !window.is_expired(now) && !window.messages.is_empty() {
                    return Ok(false);
                }
                window.messages = restored;
                window.expires_at = now + self.ttl;
            }
            Entry::Vacant(slot) => {
                slot.insert(Window {
                    messages: restored,
                    expires_at: now + self.ttl,
                });
            }
        }
        Ok(true)
    }

    async fn purge_expired(&self) -> MemoryResult<usize> {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        Ok(before.saturating_sub(self.windows.len()))
    }

    async fn stats(&self) -> MemoryResult<WindowStats> {
        let now = Instant::now();
        let mut stats = WindowStats::default();
        for window in self.windows.iter().filter(|w| !w.is_expired(now)) {
            stats.sessions += 1;
            stats.messages += window.messages.len();
        }
        Ok(stats)
    }
}
