/// Easy VM Cloud - 公共库
///
/// 控制面与 Job Runner Agent 共享的实例模型、迁移模型、错误分类与通信消息

pub mod errors;
pub mod models;
pub mod utils;
pub mod ws_rpc;

// 重新导出常用类型
pub use errors::{Error, FieldError, FieldErrorCode, Result};
pub use ws_rpc::{MessageType, RpcError, RpcErrorCode, RpcMessage};
