/// 虚拟机管理接口
///
/// 变更统一走 `POST /api/vms/:uuid?action=...`，迁移再以 `migration_action` 区分子动作。

use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use common::models::{Instance, InstanceState, MigrationAction, MigrationRecord};
use common::FieldError;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;
use validator::Validate;

use super::error::{ApiError, ApiResult};
use crate::app_state::AppState;
use crate::migration::{MigrateOptions, MigrateResponse, MigrationService};
use crate::services::vm_service::{CreateInstanceDto, VmService};

/// 列表过滤条件
#[derive(Debug, Deserialize)]
pub struct ListVmsQuery {
    pub node_id: Option<String>,
    pub state: Option<InstanceState>,
}

/// 动作参数
#[derive(Debug, Deserialize)]
pub struct ActionQuery {
    pub action: Option<String>,
    pub migration_action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResizeBody {
    billing_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct DeleteDiskBody {
    disk_uuid: Option<Uuid>,
}

/// VM 路由
pub fn vm_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_vms).post(create_vm))
        .route("/:uuid", get(get_vm).post(vm_action))
        .route("/:uuid/migrate", get(get_migration))
        .route("/:uuid/migrate/watch", get(watch_migration))
}

/// GET /api/vms?node_id=xxx&state=running
pub async fn list_vms(
    State(state): State<AppState>,
    query: Result<Query<ListVmsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Instance>>> {
    let Query(query) = query?;
    let service = VmService::new(state);
    let instances = service.list_vms(query.node_id.as_deref(), query.state).await?;
    Ok(Json(instances))
}

/// POST /api/vms
pub async fn create_vm(
    State(state): State<AppState>,
    payload: Result<Json<CreateInstanceDto>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(dto) = payload?;
    dto.validate()?;

    let service = VmService::new(state);
    let accepted = service.create_vm(dto).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

/// GET /api/vms/:uuid
pub async fn get_vm(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<Instance>> {
    let service = VmService::new(state);
    Ok(Json(service.get_vm(uuid).await?))
}

/// POST /api/vms/:uuid?action=...
pub async fn vm_action(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    query: Result<Query<ActionQuery>, QueryRejection>,
    body: Bytes,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let body: JsonValue = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))?
    };

    let action = query
        .action
        .or_else(|| body.get("action").and_then(|v| v.as_str()).map(str::to_string))
        .ok_or_else(|| FieldError::missing("action"))?;

    let service = VmService::new(state.clone());
    let accepted = match action.as_str() {
        "start" => service.start_vm(uuid).await?,
        "stop" => service.stop_vm(uuid).await?,
        "reboot" => service.reboot_vm(uuid).await?,
        "resize" => {
            let request: ResizeBody = parse_body(body)?;
            service.resize_vm(uuid, request.billing_id).await?
        }
        "create_disk" => service.create_disk(uuid, parse_body(body)?).await?,
        "resize_disk" => service.resize_disk(uuid, parse_body(body)?).await?,
        "delete_disk" => {
            let request: DeleteDiskBody = parse_body(body)?;
            service.delete_disk(uuid, request.disk_uuid).await?
        }
        "migrate" => {
            let migration_action = query
                .migration_action
                .or_else(|| {
                    body.get("migration_action")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .ok_or_else(|| FieldError::missing("migration_action"))?;
            return migrate(state, uuid, &migration_action, body).await;
        }
        other => {
            return Err(FieldError::invalid("action", format!("Unsupported action {}", other)).into());
        }
    };

    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

async fn migrate(state: AppState, uuid: Uuid, migration_action: &str, body: JsonValue) -> ApiResult<Response> {
    let action: MigrationAction = migration_action
        .parse()
        .map_err(|e: String| FieldError::invalid("migration_action", e))?;
    let options: MigrateOptions = parse_body(body)?;

    let service = MigrationService::new(state);
    let response = match service.migrate(uuid, action, options).await? {
        estimate @ MigrateResponse::Estimate(_) => (StatusCode::OK, Json(estimate)).into_response(),
        outcome @ MigrateResponse::Action(_) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
    };
    Ok(response)
}

/// GET /api/vms/:uuid/migrate
pub async fn get_migration(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Json<MigrationRecord>> {
    let service = MigrationService::new(state);
    Ok(Json(service.get(uuid).await?))
}

/// GET /api/vms/:uuid/migrate/watch
///
/// 以 ndjson 流输出进度事件，阶段结束后关闭。
pub async fn watch_migration(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> ApiResult<Response> {
    let service = MigrationService::new(state);
    let receiver = service.watch(uuid).await?;

    let stream = UnboundedReceiverStream::new(receiver).map(|event| event.to_line());
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Domain(common::Error::Internal(e.to_string())))?;
    Ok(response)
}

fn parse_body<T: DeserializeOwned>(body: JsonValue) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError::BadRequest(format!("Invalid parameters: {}", e)))
}
