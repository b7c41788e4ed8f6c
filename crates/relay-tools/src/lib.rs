// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod cancel;
pub mod policy;
pub mod registry;
pub mod tool;

pub use cancel::CancelToken;
pub use policy::{ApprovalPolicy, ToolPolicy};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolKind, ToolOutput, ToolOutputPart};

pub use builtin::fs::FsTool;
pub use builtin::read_image::ReadImageTool;
pub use builtin::shell::ShellTool;
