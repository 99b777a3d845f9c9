/// 套餐管理接口

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use common::models::Package;
use validator::Validate;

use super::error::ApiResult;
use crate::app_state::AppState;
use crate::services::package_service::{CreatePackageDto, PackageService};

pub fn package_routes() -> Router<AppState> {
    Router::new().route("/", get(list_packages).post(create_package))
}

/// GET /api/packages
pub async fn list_packages(State(state): State<AppState>) -> ApiResult<Json<Vec<Package>>> {
    let service = PackageService::new(state);
    Ok(Json(service.list_packages().await?))
}

/// POST /api/packages
pub async fn create_package(
    State(state): State<AppState>,
    payload: Result<Json<CreatePackageDto>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Package>)> {
    let Json(dto) = payload?;
    dto.validate()?;

    let service = PackageService::new(state);
    let package = service.create_package(dto).await?;
    Ok((StatusCode::CREATED, Json(package)))
}
