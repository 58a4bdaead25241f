//! 工具服务端：把本地注册表通过管道 / WebSocket / HTTP 会话暴露出去

pub mod handler;
pub mod http;
pub mod socket;
pub mod stdio;

pub use handler::ToolServer;
pub use http::{router, serve_http, SessionError, SessionTable, SessionTransport};
pub use socket::serve_socket;
pub use stdio::{serve_lines, serve_stdio};
