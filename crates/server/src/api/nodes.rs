/// 计算节点容量查询

use axum::{extract::State, routing::get, Json, Router};
use common::models::NodeCapacity;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub capacity: NodeCapacity,
    /// Agent 连接是否在线
    pub online: bool,
}

pub fn node_routes() -> Router<AppState> {
    Router::new().route("/", get(list_nodes))
}

/// GET /api/nodes
pub async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeView>> {
    let agents = state.agent_manager();
    let mut capacities = state.capacity().list().await;
    capacities.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    let mut nodes = Vec::with_capacity(capacities.len());
    for capacity in capacities {
        let online = agents.is_online(&capacity.node_id).await;
        nodes.push(NodeView { capacity, online });
    }
    Json(nodes)
}
