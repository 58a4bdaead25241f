//! 计划层：数据模型、依赖图、补丁、运行历史、依赖上下文、补丁控制器与执行引擎

pub mod args;
pub mod author;
pub mod builder;
pub mod context;
pub mod controller;
pub mod engine;
pub mod events;
pub mod graph;
pub mod history;
pub mod patch;
pub mod types;

pub use args::{ArgRequest, ArgumentGenerator, DraftArgsGenerator, LlmArgumentGenerator};
pub use author::draft_plan;
pub use builder::PlanBuilder;
pub use context::{allowed_indices, ContextBuilder, ContextItem};
pub use controller::{PatchController, PatchInput};
pub use engine::{PlanEngine, RunReport, RunSnapshot};
pub use events::RunEvent;
pub use graph::{dependency_closure, validate};
pub use history::{HistoryEntry, HistoryKind, HistoryStore, JsonlHistoryStore, MemoryHistoryStore};
pub use patch::{apply_patch, PatchAction, PatchDecision, PatchOperation};
pub use types::{Plan, PlanError, Run, RunId, RunStatus, Step, StepId};
