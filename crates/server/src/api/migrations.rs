/// 迁移记录查询

use axum::{extract::State, routing::get, Json, Router};
use common::models::MigrationRecord;

use super::error::ApiResult;
use crate::app_state::AppState;
use crate::migration::MigrationService;

pub fn migration_routes() -> Router<AppState> {
    Router::new().route("/", get(list_migrations))
}

/// GET /api/migrations
pub async fn list_migrations(State(state): State<AppState>) -> ApiResult<Json<Vec<MigrationRecord>>> {
    let service = MigrationService::new(state);
    Ok(Json(service.list().await?))
}
