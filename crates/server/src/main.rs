/// 实例控制面 Server
///
/// 提供实例管理与迁移编排的 REST API，并通过 WebSocket 向计算节点 Agent 下发任务

mod allocation;
mod api;
mod app_state;
mod config;
mod db;
mod metrics;
mod migration;
mod services;
mod store;
mod ws;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    app_state::AppState,
    db::{ensure_schema, establish_connection, SeaOrmStore},
    store::{InstanceStore, MemoryStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 加载配置
    let cfg = config::Config::from_env()?;

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动实例控制面 Server...");

    metrics::init()?;

    // 未配置数据库时使用内存存储
    let store: Arc<dyn InstanceStore> = match cfg.database_url.as_deref() {
        Some(url) => {
            let db = establish_connection(url).await?;
            ensure_schema(&db).await?;
            info!("✅ 使用数据库存储");
            Arc::new(SeaOrmStore::new(db))
        }
        None => {
            warn!("未配置 DATABASE_URL，使用内存存储，重启后数据丢失");
            Arc::new(MemoryStore::new())
        }
    };

    let port = cfg.server_port;
    let (timeout_secs, check_secs) = (cfg.heartbeat_timeout_secs, cfg.heartbeat_check_secs);
    let app_state = AppState::with_agents(cfg, store);

    // 启动心跳监控
    app_state
        .agent_manager()
        .start_heartbeat_monitor(app_state.nodes(), timeout_secs, check_secs);
    info!("✅ 心跳监控任务已启动（{}秒超时，每{}秒检查一次）", timeout_secs, check_secs);

    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 构建应用路由
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/agent", get(ws::handle_agent_websocket))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // 启动服务器
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root_handler() -> &'static str {
    "Instance API v1"
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
