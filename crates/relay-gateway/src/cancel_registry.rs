// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-chat run preemption.
//!
//! Exactly one run is allowed in flight per chat. When a new message arrives
//! for a chat that already has a run in progress, that run's cancel token is
//! tripped before the new one is registered — "latest message wins". This is
//! a plain `Mutex<HashMap<..>>` constructed explicitly by whichever binary
//! wires up a transport; nothing here reaches for a global/static instance.

use std::collections::HashMap;

use tokio::sync::Mutex;

use relay_core::CancelToken;

/// Maps chat id to the [`CancelToken`] of its currently in-flight run, if any.
pub struct CancellationRegistry {
    inner: Mutex<HashMap<String, CancelToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Register a new run for `chat_id`, cancelling and evicting whatever run
    /// was previously registered for that chat. Returns the fresh token the
    /// caller should thread through [`relay_core::Agent::run`].
    pub async fn register(&self, chat_id: impl Into<String>) -> CancelToken {
        let chat_id = chat_id.into();
        let mut map = self.inner.lock().await;
        if let Some(previous) = map.remove(&chat_id) {
            previous.cancel();
        }
        let token = CancelToken::new();
        map.insert(chat_id, token.clone());
        token
    }

    /// Cancel the in-flight run for `chat_id`, if any, without registering a
    /// replacement. Returns `true` if a run was actually cancelled.
    pub async fn cancel(&self, chat_id: &str) -> bool {
        let mut map = self.inner.lock().await;
        match map.remove(chat_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the registration for `chat_id` without cancelling it — called by
    /// a transport once a run finishes normally so completed runs do not
    /// linger in the map.
    pub async fn clear(&self, chat_id: &str) {
        self.inner.lock().await.remove(chat_id);
    }

    /// Number of chats with a run currently registered.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_registration_is_not_cancelled() {
        let reg = CancellationRegistry::new();
        let token = reg.register("chat-1").await;
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn second_registration_cancels_the_first() {
        let reg = CancellationRegistry::new();
        let first = reg.register("chat-1").await;
        assert!(!first.is_cancelled());
        let second = reg.register("chat-1").await;
        assert!(first.is_cancelled(), "registering a new run must preempt the previous one");
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn different_chats_do_not_interfere() {
        let reg = CancellationRegistry::new();
        let a = reg.register("chat-a").await;
        let b = reg.register("chat-b").await;
        assert!(!a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_without_registration_returns_false() {
        let reg = CancellationRegistry::new();
        assert!(!reg.cancel("nope").await);
    }

    #[tokio::test]
    async fn cancel_existing_registration_returns_true_and_trips_token() {
        let reg = CancellationRegistry::new();
        let token = reg.register("chat-1").await;
        assert!(reg.cancel("chat-1").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn clear_removes_without_cancelling() {
        let reg = CancellationRegistry::new();
        let token = reg.register("chat-1").await;
        reg.clear("chat-1").await;
        assert!(!token.is_cancelled());
        assert_eq!(reg.active_count().await, 0);
    }

    #[tokio::test]
    async fn active_count_tracks_registrations() {
        let reg = CancellationRegistry::new();
        assert_eq!(reg.active_count().await, 0);
        reg.register("chat-1").await;
        reg.register("chat-2").await;
        assert_eq!(reg.active_count().await, 2);
        reg.cancel("chat-1").await;
        assert_eq!(reg.active_count().await, 1);
    }
}
