// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Re-exports [`relay_tools::CancelToken`].
//!
//! The type itself lives in `relay-tools` so that `Tool::execute` and
//! `ToolRegistry::execute` can accept it without `relay-tools` depending on
//! `relay-core`. This module exists only so `crate::cancel::CancelToken`
//! keeps resolving for existing internal callers.

pub use relay_tools::CancelToken;
