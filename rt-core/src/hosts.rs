//! Fallback host selection.
//!
//! A connection attempt sequence starts on the primary host. When the
//! primary fails with a server-side error, the client walks a shuffled copy
//! of the fixed fallback list, trying each host at most once, until one
//! works or the list is exhausted.

use rand::seq::SliceRandom;
use rtwire_types::ErrorInfo;

/// Primary host plus the fallbacks not yet tried in this sequence.
#[derive(Debug, Clone)]
pub struct Hosts {
    primary: String,
    fallbacks: Vec<String>,
    untried: Vec<String>,
}

impl Hosts {
    /// Create a selector. The primary host is never offered as a fallback.
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        let primary = primary.into();
        let fallbacks = fallbacks.into_iter().filter(|h| *h != primary).collect();
        let mut hosts = Self {
            primary,
            fallbacks,
            untried: Vec::new(),
        };
        hosts.reset();
        hosts
    }

    /// The primary host.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Start a new attempt sequence: every fallback becomes available again,
    /// in a fresh random order.
    pub fn reset(&mut self) {
        self.untried = self.fallbacks.clone();
        self.untried.shuffle(&mut rand::thread_rng());
    }

    /// Whether an untried fallback remains.
    pub fn has_fallback(&self) -> bool {
        !self.untried.is_empty()
    }

    /// Pick the next host after `current` failed with `reason`.
    ///
    /// Returns `None` when the reason is not a server-side problem or every
    /// fallback has been tried.
    pub fn next(&mut self, current: &str, reason: Option<&ErrorInfo>) -> Option<String> {
        if reason.is_some_and(|r| !r.is_server_error()) {
            return None;
        }
        while let Some(host) = self.untried.pop() {
            if host != current {
                return Some(host);
            }
        }
        None
    }
}
