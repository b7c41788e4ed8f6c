// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Inbound message buffering at the transport boundary.
//!
//! Three orthogonal, independently-timed buffers sit between a transport
//! (chat bot, HTTP, RPC) and the agent loop core, all feeding the same
//! output channel:
//!
//! - [`fragment`]: a long message (> 4000 chars) opens a sequence that
//!   swallows immediately-following, consecutively-numbered messages from the
//!   same `(chat, user)` and concatenates them with no separator.
//! - `debounce`: short text messages from the same `(chat, user)` are merged
//!   with newline separators after a quiet period, so a user typing three
//!   quick messages in a row is seen as one turn.
//! - `media group`: messages sharing a transport-assigned `media_group_id`
//!   (an album/gallery upload) are collected briefly and delivered as one
//!   message with a combined media list.
//!
//! Commands (`/`-prefixed text) and standalone media (no group id) bypass
//! all three and are forwarded immediately — see [`InboundBuffer::submit`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::trace;

const FRAGMENT_OPEN_THRESHOLD: usize = 4000;
const FRAGMENT_WINDOW: Duration = Duration::from_millis(1500);
const FRAGMENT_MAX_PARTS: usize = 12;
const FRAGMENT_MAX_CHARS: usize = 50_000;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(1500);

const MEDIA_GROUP_WINDOW: Duration = Duration::from_millis(500);

/// One attachment carried by an inbound message, in whatever order the
/// transport reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub message_id: u64,
    pub kind: String,
    pub url: String,
}

/// A single message as handed to the buffer by a transport adapter, before
/// any coalescing.
#[derive(Debug, Clone)]
pub struct RawInbound {
    pub chat_id: String,
    pub user_id: String,
    /// Transport-assigned message id. Must be monotonically increasing per
    /// `(chat_id, user_id)` for fragment-sequence detection to work; a
    /// non-consecutive id is treated as a gap.
    pub message_id: u64,
    pub text: String,
    pub media: Vec<MediaAttachment>,
    /// Present only for messages the transport reports as part of a
    /// multi-attachment album/gallery upload.
    pub media_group_id: Option<String>,
}

impl RawInbound {
    fn is_command(&self) -> bool {
        self.text.starts_with('/')
    }

    /// Media attached outside of any transport-reported group — delivered
    /// immediately rather than held for possible siblings.
    fn is_standalone_media(&self) -> bool {
        !self.media.is_empty() && self.media_group_id.is_none()
    }
}

/// The coalesced result of one or more [`RawInbound`] messages, ready to be
/// submitted to the agent loop as a single user turn.
#[derive(Debug, Clone)]
pub struct CoalescedMessage {
    pub chat_id: String,
    pub user_id: String,
    pub text: String,
    pub media: Vec<MediaAttachment>,
}

type ChatUserKey = (String, String);

struct FragmentState {
    parts: Vec<String>,
    total_chars: usize,
    last_message_id: u64,
    generation: u64,
}

struct DebounceState {
    parts: Vec<String>,
    generation: u64,
}

struct MediaGroupState {
    chat_id: String,
    user_id: String,
    /// Non-empty text from whichever member carried a caption, plus any
    /// attachments, collected in message-id order.
    caption: Option<String>,
    media: Vec<MediaAttachment>,
    generation: u64,
}

/// Coalesces raw transport messages into turn-ready [`CoalescedMessage`]s.
///
/// Cheap to clone (all state lives behind `Arc`s); the timer tasks spawned
/// internally hold their own clones and outlive any particular `submit`
/// call, so the buffer does not need to be kept alive by the caller beyond
/// construction.
#[derive(Clone)]
pub struct InboundBuffer {
    fragments: Arc<Mutex<HashMap<ChatUserKey, FragmentState>>>,
    debounce: Arc<Mutex<HashMap<ChatUserKey, DebounceState>>>,
    media_groups: Arc<Mutex<HashMap<String, MediaGroupState>>>,
    out: mpsc::Sender<CoalescedMessage>,
}

impl InboundBuffer {
    /// Construct a buffer that delivers coalesced messages on `out`. The
    /// caller owns the paired receiver and drives the transport loop from it.
    pub fn new(out: mpsc::Sender<CoalescedMessage>) -> Self {
        Self {
            fragments: Arc::new(Mutex::new(HashMap::new())),
            debounce: Arc::new(Mutex::new(HashMap::new())),
            media_groups: Arc::new(Mutex::new(HashMap::new())),
            out,
        }
    }

    /// Feed one raw transport message through the buffer. Returns
    /// immediately; coalesced output (including this message's eventual
    /// contribution) arrives later on the `out` channel.
    pub async fn submit(&self, msg: RawInbound) {
        if msg.is_command() || msg.is_standalone_media() {
            trace!(chat = %msg.chat_id, "bypassing buffers: command or standalone media");
            let coalesced = CoalescedMessage {
                chat_id: msg.chat_id,
                user_id: msg.user_id,
                text: msg.text,
                media: msg.media,
            };
            let _ = self.out.send(coalesced).await;
            return;
        }

        if let Some(group_id) = msg.media_group_id.clone() {
            self.submit_media_group(group_id, msg).await;
            return;
        }

        let key = (msg.chat_id.clone(), msg.user_id.clone());

        // A long opener starts (or continues) a fragment sequence. Any
        // pending debounce entry for the same key is flushed first so the
        // two buffers never hold overlapping state for one key.
        let continues_fragment = {
            let fragments = self.fragments.lock().await;
            fragments
                .get(&key)
                .map(|f| msg.message_id == f.last_message_id + 1)
                .unwrap_or(false)
        };

        if msg.text.len() > FRAGMENT_OPEN_THRESHOLD || continues_fragment {
            self.flush_debounce_key(&key).await;
            self.submit_fragment(key, msg).await;
        } else {
            self.flush_fragment_key(&key).await;
            self.submit_debounce(key, msg).await;
        }
    }

    // ── Fragment reassembler ───────────────────────────────────────────────

    async fn submit_fragment(&self, key: ChatUserKey, msg: RawInbound) {
        let mut fragments = self.fragments.lock().await;
        let entry = fragments.entry(key.clone()).or_insert_with(|| FragmentState {
            parts: Vec::new(),
            total_chars: 0,
            last_message_id: msg.message_id.wrapping_sub(1),
            generation: 0,
        });

        let is_gap = !entry.parts.is_empty() && msg.message_id != entry.last_message_id + 1;
        if is_gap {
            let stale = std::mem::replace(
                entry,
                FragmentState { parts: Vec::new(), total_chars: 0, last_message_id: msg.message_id, generation: entry.generation + 1 },
            );
            drop(fragments);
            self.flush_fragment_state(&key, stale).await;
            fragments = self.fragments.lock().await;
        }

        let entry = fragments.get_mut(&key).expect("just inserted");
        entry.total_chars += msg.text.len();
        entry.parts.push(msg.text);
        entry.last_message_id = msg.message_id;
        entry.generation += 1;
        let generation = entry.generation;

        let at_cap = entry.parts.len() >= FRAGMENT_MAX_PARTS || entry.total_chars >= FRAGMENT_MAX_CHARS;
        if at_cap {
            let done = fragments.remove(&key).expect("just inserted");
            drop(fragments);
            self.flush_fragment_state(&key, done).await;
            return;
        }
        drop(fragments);

        let this = self.clone();
        let key_for_timer = key;
        tokio::spawn(async move {
            tokio::time::sleep(FRAGMENT_WINDOW).await;
            let mut fragments = this.fragments.lock().await;
            let expired = match fragments.get(&key_for_timer) {
                Some(state) if state.generation == generation => fragments.remove(&key_for_timer),
                _ => None,
            };
            drop(fragments);
            if let Some(state) = expired {
                this.flush_fragment_state(&key_for_timer, state).await;
            }
        });
    }

    async fn flush_fragment_key(&self, key: &ChatUserKey) {
        let removed = self.fragments.lock().await.remove(key);
        if let Some(state) = removed {
            self.flush_fragment_state(key, state).await;
        }
    }

    async fn flush_fragment_state(&self, key: &ChatUserKey, state: FragmentState) {
        if state.parts.is_empty() {
            return;
        }
        let coalesced = CoalescedMessage {
            chat_id: key.0.clone(),
            user_id: key.1.clone(),
            text: state.parts.concat(),
            media: Vec::new(),
        };
        let _ = self.out.send(coalesced).await;
    }

    // ── Debounce ────────────────────────────────────────────────────────────

    async fn submit_debounce(&self, key: ChatUserKey, msg: RawInbound) {
        let mut debounce = self.debounce.lock().await;
        let entry = debounce.entry(key.clone()).or_insert_with(|| DebounceState { parts: Vec::new(), generation: 0 });
        entry.parts.push(msg.text);
        entry.generation += 1;
        let generation = entry.generation;
        drop(debounce);

        let this = self.clone();
        let key_for_timer = key;
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            let mut debounce = this.debounce.lock().await;
            let expired = match debounce.get(&key_for_timer) {
                Some(state) if state.generation == generation => debounce.remove(&key_for_timer),
                _ => None,
            };
            drop(debounce);
            if let Some(state) = expired {
                this.flush_debounce_state(&key_for_timer, state).await;
            }
        });
    }

    async fn flush_debounce_key(&self, key: &ChatUserKey) {
        let removed = self.debounce.lock().await.remove(key);
        if let Some(state) = removed {
            self.flush_debounce_state(key, state).await;
        }
    }

    async fn flush_debounce_state(&self, key: &ChatUserKey, state: DebounceState) {
        if state.parts.is_empty() {
            return;
        }
        let coalesced = CoalescedMessage {
            chat_id: key.0.clone(),
            user_id: key.1.clone(),
            text: state.parts.join("\n"),
            media: Vec::new(),
        };
        let _ = self.out.send(coalesced).await;
    }

    // ── Media group ─────────────────────────────────────────────────────────

    async fn submit_media_group(&self, group_id: String, msg: RawInbound) {
        let mut groups = self.media_groups.lock().await;
        let entry = groups.entry(group_id.clone()).or_insert_with(|| MediaGroupState {
            chat_id: msg.chat_id.clone(),
            user_id: msg.user_id.clone(),
            caption: None,
            media: Vec::new(),
            generation: 0,
        });
        if !msg.text.trim().is_empty() {
            entry.caption = Some(msg.text.clone());
        }
        entry.media.extend(msg.media.iter().cloned());
        entry.generation += 1;
        let generation = entry.generation;
        drop(groups);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(MEDIA_GROUP_WINDOW).await;
            let mut groups = this.media_groups.lock().await;
            let expired = match groups.get(&group_id) {
                Some(state) if state.generation == generation => groups.remove(&group_id),
                _ => None,
            };
            drop(groups);
            if let Some(mut state) = expired {
                state.media.sort_by_key(|m| m.message_id);
                let coalesced = CoalescedMessage {
                    chat_id: state.chat_id,
                    user_id: state.user_id,
                    text: state.caption.unwrap_or_default(),
                    media: state.media,
                };
                let _ = this.out.send(coalesced).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw(chat: &str, user: &str, id: u64, text: &str) -> RawInbound {
        RawInbound {
            chat_id: chat.into(),
            user_id: user.into(),
            message_id: id,
            text: text.into(),
            media: Vec::new(),
            media_group_id: None,
        }
    }

    #[tokio::test]
    async fn command_bypasses_buffers() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);
        buf.submit(raw("c1", "u1", 1, "/start")).await;
        let out = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.unwrap().unwrap();
        assert_eq!(out.text, "/start");
    }

    #[tokio::test]
    async fn standalone_media_bypasses_buffers() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);
        let mut msg = raw("c1", "u1", 1, "");
        msg.media = vec![MediaAttachment { message_id: 1, kind: "photo".into(), url: "x".into() }];
        buf.submit(msg).await;
        let out = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.unwrap().unwrap();
        assert_eq!(out.media.len(), 1);
    }

    #[tokio::test]
    async fn debounce_merges_quick_successive_short_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);
        buf.submit(raw("c1", "u1", 1, "hello")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        buf.submit(raw("c1", "u1", 2, "world")).await;

        let out = tokio::time::timeout(Duration::from_millis(2000), rx.recv()).await.unwrap().unwrap();
        assert_eq!(out.text, "hello\nworld");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "only one coalesced message should be emitted"
        );
    }

    #[tokio::test]
    async fn debounce_flushes_after_quiescence_with_no_further_input() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);
        buf.submit(raw("c1", "u1", 1, "only one")).await;
        let out = tokio::time::timeout(Duration::from_millis(2000), rx.recv()).await.unwrap().unwrap();
        assert_eq!(out.text, "only one");
    }

    #[tokio::test]
    async fn fragment_opens_on_long_message_and_appends_consecutive_ids() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);
        let long = "a".repeat(FRAGMENT_OPEN_THRESHOLD + 1);
        buf.submit(raw("c1", "u1", 1, &long)).await;
        buf.submit(raw("c1", "u1", 2, "tail")).await;

        let out = tokio::time::timeout(Duration::from_millis(2000), rx.recv()).await.unwrap().unwrap();
        assert_eq!(out.text, format!("{long}tail"), "fragments concatenate with no separator");
    }

    #[tokio::test]
    async fn fragment_flushes_on_id_gap() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);
        let long = "a".repeat(FRAGMENT_OPEN_THRESHOLD + 1);
        buf.submit(raw("c1", "u1", 1, &long)).await;
        // id 5 is not consecutive after 1 -> the opener flushes immediately,
        // and "gap" itself starts its own (short) debounce turn.
        buf.submit(raw("c1", "u1", 5, "gap")).await;

        let first = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.text, long);
        let second = tokio::time::timeout(Duration::from_millis(2000), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.text, "gap");
    }

    #[tokio::test]
    async fn fragment_flushes_at_part_cap() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);
        let long = "a".repeat(FRAGMENT_OPEN_THRESHOLD + 1);
        buf.submit(raw("c1", "u1", 1, &long)).await;
        for i in 2..=FRAGMENT_MAX_PARTS as u64 {
            buf.submit(raw("c1", "u1", i, "x")).await;
        }
        let out = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
        assert_eq!(out.text.len(), long.len() + (FRAGMENT_MAX_PARTS - 1));
    }

    #[tokio::test]
    async fn media_group_combines_caption_and_attachments_in_id_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);

        let mut m1 = raw("c1", "u1", 2, "");
        m1.media_group_id = Some("g1".into());
        m1.media = vec![MediaAttachment { message_id: 2, kind: "photo".into(), url: "b".into() }];

        let mut m2 = raw("c1", "u1", 1, "look at these");
        m2.media_group_id = Some("g1".into());
        m2.media = vec![MediaAttachment { message_id: 1, kind: "photo".into(), url: "a".into() }];

        buf.submit(m1).await;
        buf.submit(m2).await;

        let out = tokio::time::timeout(Duration::from_millis(2000), rx.recv()).await.unwrap().unwrap();
        assert_eq!(out.text, "look at these");
        assert_eq!(out.media.iter().map(|m| m.url.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn different_chats_do_not_interfere_with_debounce() {
        let (tx, mut rx) = mpsc::channel(8);
        let buf = InboundBuffer::new(tx);
        buf.submit(raw("c1", "u1", 1, "from c1")).await;
        buf.submit(raw("c2", "u1", 1, "from c2")).await;

        let mut seen = vec![];
        for _ in 0..2 {
            let out = tokio::time::timeout(Duration::from_millis(2000), rx.recv()).await.unwrap().unwrap();
            seen.push(out.text);
        }
        seen.sort();
        assert_eq!(seen, vec!["from c1".to_string(), "from c2".to_string()]);
    }
}
