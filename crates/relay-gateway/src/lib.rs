// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Transport-facing plumbing shared by every concrete gateway transport
//! (chat bot, HTTP, RPC server): per-chat run preemption and inbound
//! message coalescing. Neither module reaches for a hidden global/static —
//! a binary wiring up a transport constructs one [`CancellationRegistry`]
//! and one [`InboundBuffer`] explicitly and threads them through.

mod cancel_registry;
mod inbound;

pub use cancel_registry::CancellationRegistry;
pub use inbound::{CoalescedMessage, InboundBuffer, MediaAttachment, RawInbound};
