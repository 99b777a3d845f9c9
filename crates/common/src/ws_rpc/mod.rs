/// WebSocket RPC 模块
///
/// 控制面与计算节点 Agent（Job Runner）之间的消息信封与负载定义

pub mod error;
pub mod message;
pub mod types;

pub use error::{RpcError, RpcErrorCode};
pub use message::{MessageType, RpcMessage};
pub use types::*;
