pub mod call_log;
pub mod conversation_store;
pub mod council;
pub mod json_role;
pub mod pipeline;
pub mod scope;
pub mod tool_runtime;

pub use conversation_store::{ConversationStore, ConversationStoreError, InMemoryConversationStore};
pub use council::{CouncilEngine, CouncilOutcome};
pub use pipeline::{resolve_pipeline_models, PipelineEngine, PipelineOutcome, PipelineRoles};
pub use tool_runtime::{RunSlot, ToolError, ToolFailure, ToolRuntime, ToolSurface};
