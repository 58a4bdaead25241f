//! 工具调用协议层
//!
//! - protocol：JSON-RPC 2.0 报文、工具描述与调用结果的线上形状
//! - transport：客户端传输（pipe / socket / http）
//! - client：ClientManager，维护外部 provider 连接
//! - server：ToolServer 与三种服务端传输，HTTP 会话表

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ClientManager, ProviderConnection};
pub use server::{SessionTable, ToolServer};
pub use transport::{Transport, TransportError};
