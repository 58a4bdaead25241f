//! 工具层：本地注册表、调用信封、本地 / 外部调度

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::ToolDispatcher;
pub use registry::{Tool, ToolDescriptor, ToolErrorInfo, ToolOutcome, ToolProvider, ToolRegistry};
pub use schema::schema_json;
