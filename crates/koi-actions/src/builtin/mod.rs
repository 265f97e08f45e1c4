// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod ask_parent;
mod edit_file;
mod grep;
mod kv;
mod llm_task;
mod mcp_tool;
mod print;
mod prompt_user;
mod read_file;
mod ret;
mod search;
mod shell;
mod update_state;
mod web_fetch;
mod web_search;
mod write_file;

pub use ask_parent::AskParentAction;
pub use edit_file::EditFileAction;
pub use grep::GrepAction;
pub use kv::{KvGetAction, KvSearchAction, KvSetAction};
pub use llm_task::LlmTaskAction;
pub use mcp_tool::McpToolAction;
pub use print::PrintAction;
pub use prompt_user::PromptUserAction;
pub use read_file::ReadFileAction;
pub use ret::ReturnAction;
pub use search::SearchAction;
pub use shell::ShellAction;
pub use update_state::UpdateStateAction;
pub use web_fetch::WebFetchAction;
pub use web_search::WebSearchAction;
pub use write_file::WriteFileAction;

use crate::ActionRegistry;

/// Register the complete builtin action set.
pub fn register_defaults(registry: &mut ActionRegistry) {
    registry.register(PrintAction);
    registry.register(PromptUserAction);
    registry.register(ReturnAction);
    registry.register(ReadFileAction);
    registry.register(WriteFileAction);
    registry.register(EditFileAction);
    registry.register(GrepAction);
    registry.register(SearchAction);
    registry.register(ShellAction);
    registry.register(WebFetchAction);
    registry.register(WebSearchAction);
    registry.register(UpdateStateAction);
    registry.register(LlmTaskAction);
    registry.register(AskParentAction);
    registry.register(McpToolAction);
    registry.register(KvGetAction);
    registry.register(KvSetAction);
    registry.register(KvSearchAction);
}
