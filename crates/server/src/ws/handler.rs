/// WebSocket 连接处理器
///
/// 处理与 Agent 的 WebSocket 连接：注册、心跳、容量上报以及任务进度/结果上报

use super::agent_manager::AgentConnection;
use super::AgentConnectionManager;
use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use common::ws_rpc::{
    methods, JobFinishedNotification, JobProgressNotification, MessageType, NodeCapacityReport,
    RegisterRequest, RegisterResponse, RpcError, RpcMessage,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::metrics;
use crate::migration::MigrationService;
use crate::services::job_service::{record_finished, record_progress};
use crate::services::vm_service::VmService;

/// WebSocket 升级处理器
pub async fn handle_agent_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let manager = state.agent_manager();
    ws.on_upgrade(move |socket| handle_agent_connection(socket, manager, state))
}

/// 处理 Agent WebSocket 连接
async fn handle_agent_connection(socket: WebSocket, manager: AgentConnectionManager, state: AppState) {
    info!("新的 Agent WebSocket 连接");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // 创建消息发送通道
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();

    // 等待注册消息
    let (request_id, register) = match wait_for_registration(&mut ws_receiver).await {
        Ok(info) => info,
        Err(e) => {
            error!("Agent 注册失败: {}", e);
            let _ = ws_sender.close().await;
            return;
        }
    };

    // 发送注册成功响应
    let register_response = RegisterResponse {
        success: true,
        message: "注册成功".to_string(),
    };
    let response_msg = match serde_json::to_value(&register_response) {
        Ok(payload) => RpcMessage::response(request_id, payload),
        Err(e) => {
            error!("序列化注册响应失败: {}", e);
            return;
        }
    };
    if let Err(e) = send_message(&mut ws_sender, response_msg).await {
        error!("发送注册响应失败: {}", e);
        return;
    }

    let node_id = register.node_id.clone();
    let connection = manager
        .register(register.node_id, register.hostname, register.ip_address, tx)
        .await;
    metrics::agent_connected();

    info!(
        "Agent 已连接并注册: node_id={}, hostname={}, ip={}",
        connection.node_id, connection.hostname, connection.ip_address
    );

    // 创建消息发送任务
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_message(&mut ws_sender, msg).await {
                error!("发送消息失败: {}", e);
                break;
            }
        }
        debug!("消息发送任务结束");
    });

    // 创建消息接收任务
    let recv_connection = connection.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(AxumWsMessage::Close(_)) => break,
                Ok(msg) => {
                    if let Err(e) = handle_incoming_message(msg, &recv_connection, &state).await {
                        warn!("处理消息失败: node_id={}, error={}", recv_connection.node_id, e);
                    }
                }
                Err(e) => {
                    error!("接收消息错误: {}", e);
                    break;
                }
            }
        }
        debug!("消息接收任务结束");
    });

    // 等待任一任务完成
    tokio::select! {
        _ = &mut send_task => {
            debug!("发送任务已结束");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("接收任务已结束");
            send_task.abort();
        }
    }

    // 清理：从管理器中注销
    manager.unregister(&node_id).await;
    metrics::agent_disconnected();
    info!("Agent 连接已关闭: {}", node_id);
}

/// 等待并处理注册消息，返回请求 ID 与注册信息
async fn wait_for_registration(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
) -> Result<(String, RegisterRequest), String> {
    match tokio::time::timeout(std::time::Duration::from_secs(10), receiver.next()).await {
        Ok(Some(Ok(msg))) => {
            let rpc_msg = parse_websocket_message(msg).map_err(|e| format!("解析注册消息失败: {}", e))?;

            if rpc_msg.message_type != MessageType::Request {
                return Err("期望收到注册请求".to_string());
            }
            if rpc_msg.method.as_deref() != Some(methods::REGISTER) {
                return Err(format!("期望 register 方法，收到: {:?}", rpc_msg.method));
            }

            let register: RegisterRequest = rpc_msg.parse_payload().map_err(|e| e.to_string())?;
            if register.node_id.is_empty() {
                return Err("node_id 不能为空".to_string());
            }
            Ok((rpc_msg.id, register))
        }
        Ok(Some(Err(e))) => Err(format!("接收注册消息错误: {}", e)),
        Ok(None) => Err("连接已关闭".to_string()),
        Err(_) => Err("等待注册消息超时".to_string()),
    }
}

/// 处理收到的消息
async fn handle_incoming_message(
    ws_msg: AxumWsMessage,
    connection: &AgentConnection,
    state: &AppState,
) -> Result<(), String> {
    let rpc_msg = parse_websocket_message(ws_msg)?;

    debug!(
        "收到消息: type={:?}, method={:?}, id={}",
        rpc_msg.message_type, rpc_msg.method, rpc_msg.id
    );

    match rpc_msg.message_type {
        MessageType::Notification => handle_notification(rpc_msg, connection, state)
            .await
            .map_err(|e| e.to_string()),
        MessageType::Request => {
            let method = rpc_msg.method.clone().unwrap_or_default();
            warn!("未知的请求方法: {}", method);
            connection
                .send(RpcMessage::error_response(rpc_msg.id, &RpcError::method_not_found(method)))
                .map_err(|e| e.to_string())
        }
        MessageType::Response => {
            debug!("忽略响应消息: {}", rpc_msg.id);
            Ok(())
        }
    }
}

/// 处理通知消息
async fn handle_notification(
    msg: RpcMessage,
    connection: &AgentConnection,
    state: &AppState,
) -> Result<(), RpcError> {
    let method = msg
        .method
        .as_deref()
        .ok_or_else(|| RpcError::invalid_request("通知消息缺少方法名"))?;

    match method {
        methods::HEARTBEAT => {
            connection.update_heartbeat().await;
            debug!("收到心跳: node_id={}", connection.node_id);
            Ok(())
        }
        methods::NODE_CAPACITY => {
            let report: NodeCapacityReport = msg.parse_payload()?;
            if report.node_id != connection.node_id {
                warn!(
                    "忽略其他节点的容量上报: connection={}, report={}",
                    connection.node_id, report.node_id
                );
                return Ok(());
            }
            state.nodes().report(report).await;
            Ok(())
        }
        methods::JOB_PROGRESS => {
            let progress: JobProgressNotification = msg.parse_payload()?;
            dispatch_job_progress(state, &progress)
                .await
                .map_err(|e| RpcError::invalid_params(e.to_string()))
        }
        methods::JOB_FINISHED => {
            let finished: JobFinishedNotification = msg.parse_payload()?;
            dispatch_job_finished(state, &finished)
                .await
                .map_err(|e| RpcError::invalid_params(e.to_string()))
        }
        _ => {
            warn!("未知的通知方法: {}", method);
            Ok(())
        }
    }
}

/// 任务进度：更新任务记录并转发给迁移编排
pub async fn dispatch_job_progress(state: &AppState, progress: &JobProgressNotification) -> common::Result<()> {
    let Some(job) = record_progress(state.store(), progress).await? else {
        return Ok(());
    };
    MigrationService::new(state.clone())
        .handle_job_progress(&job, progress)
        .await
}

/// 任务结束：迁移任务交给编排器，其余任务写回实例
pub async fn dispatch_job_finished(state: &AppState, finished: &JobFinishedNotification) -> common::Result<()> {
    let Some(job) = record_finished(state.store(), finished).await? else {
        debug!("忽略重复或未知的任务结果: {}", finished.job_uuid);
        return Ok(());
    };
    metrics::job_finished(job.kind.as_str(), job.execution.as_str());

    if job.kind.is_migration() {
        MigrationService::new(state.clone())
            .handle_job_finished(&job, finished)
            .await
    } else {
        VmService::new(state.clone()).apply_finished_job(&job).await
    }
}

/// 解析 WebSocket 消息为 RPC 消息
fn parse_websocket_message(ws_msg: AxumWsMessage) -> Result<RpcMessage, String> {
    match ws_msg {
        AxumWsMessage::Text(text) => {
            RpcMessage::from_json(&text).map_err(|e| format!("解析 JSON 失败: {}", e))
        }
        AxumWsMessage::Binary(data) => {
            let text = String::from_utf8(data).map_err(|e| format!("二进制转字符串失败: {}", e))?;
            RpcMessage::from_json(&text).map_err(|e| format!("解析 JSON 失败: {}", e))
        }
        AxumWsMessage::Close(_) => Err("连接关闭".to_string()),
        _ => Err("不支持的消息类型".to_string()),
    }
}

/// 发送 RPC 消息
async fn send_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, AxumWsMessage>,
    msg: RpcMessage,
) -> Result<(), String> {
    let json = msg.to_json().map_err(|e| format!("序列化消息失败: {}", e))?;

    sender
        .send(AxumWsMessage::Text(json))
        .await
        .map_err(|e| format!("发送 WebSocket 消息失败: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrateOptions;
    use crate::services::testing::{bhyve_instance, test_env};
    use crate::store::InstanceStore;
    use common::models::{InstanceState, JobExecution, MigrationState};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_notifications_drive_migration_and_vm_updates() {
        let env = test_env();
        env.add_node("cn-1", 65536, 1_000_000).await;
        env.add_node("cn-2", 65536, 1_000_000).await;
        let vm = bhyve_instance();
        env.add_instance(&vm).await;

        let migration = MigrationService::new(env.state.clone());
        let job_uuid = migration
            .begin(vm.uuid, MigrateOptions::default())
            .await
            .unwrap()
            .job_uuid
            .unwrap();

        let progress = JobProgressNotification {
            job_uuid,
            current_progress: 55,
            total_progress: 100,
            message: None,
            transfer_bytes_second: None,
            eta_ms: None,
        };
        dispatch_job_progress(&env.state, &progress).await.unwrap();
        let record = env.store.get_migration(vm.uuid).await.unwrap().unwrap();
        assert_eq!(record.progress_history[0].current_progress, 55);

        let finished = JobFinishedNotification {
            job_uuid,
            execution: JobExecution::Succeeded,
            chain_results: Vec::new(),
            transferred_bytes: None,
        };
        dispatch_job_finished(&env.state, &finished).await.unwrap();
        // 重复上报不会再次推进
        dispatch_job_finished(&env.state, &finished).await.unwrap();
        let record = env.store.get_migration(vm.uuid).await.unwrap().unwrap();
        assert_eq!(record.state, MigrationState::Successful);
        assert_eq!(record.progress_history.len(), 1);

        let accepted = VmService::new(env.state.clone()).stop_vm(vm.uuid).await.unwrap();
        dispatch_job_finished(
            &env.state,
            &JobFinishedNotification {
                job_uuid: accepted.job_uuid,
                execution: JobExecution::Succeeded,
                chain_results: Vec::new(),
                transferred_bytes: None,
            },
        )
        .await
        .unwrap();
        let instance = env.store.get_instance(vm.uuid).await.unwrap().unwrap();
        assert_eq!(instance.state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_capacity_report_only_for_own_node() {
        let env = test_env();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection: Arc<AgentConnection> = env
            .state
            .agent_manager()
            .register("cn-1".into(), "host-1".into(), "10.0.0.1".into(), tx)
            .await;

        let report = |node: &str| {
            RpcMessage::notification(
                methods::NODE_CAPACITY,
                json!({ "node_id": node, "available_ram": 4096, "available_disk": 10000, "available_cpu": 400 }),
            )
        };
        handle_notification(report("cn-2"), &connection, &env.state).await.unwrap();
        assert!(env.state.capacity().query("cn-2").await.is_err());

        handle_notification(report("cn-1"), &connection, &env.state).await.unwrap();
        let capacity = env.state.capacity().query("cn-1").await.unwrap();
        assert_eq!(capacity.available_ram, 4096);
    }

    #[tokio::test]
    async fn test_unknown_request_gets_error_response() {
        let env = test_env();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = env
            .state
            .agent_manager()
            .register("cn-1".into(), "host-1".into(), "10.0.0.1".into(), tx)
            .await;

        let request = RpcMessage::request("list_host_interfaces", json!({}));
        let text = request.to_json().unwrap();
        handle_incoming_message(AxumWsMessage::Text(text), &connection, &env.state)
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert!(reply.is_error());
        assert_eq!(reply.id, request.id);
    }
}
