/// HTTP 接口

pub mod error;
pub mod jobs;
pub mod migrations;
pub mod nodes;
pub mod packages;
pub mod vms;

use axum::Router;

use crate::app_state::AppState;

/// 所有 API 路由（统一入口）
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/vms", vms::vm_routes())
        .nest("/migrations", migrations::migration_routes())
        .nest("/jobs", jobs::job_routes())
        .nest("/nodes", nodes::node_routes())
        .nest("/packages", packages::package_routes())
}
