/// 任务查询

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use common::models::Job;
use common::Error;
use serde::Serialize;
use uuid::Uuid;

use super::error::ApiResult;
use crate::app_state::AppState;
use crate::services::job_service::job_failure;

/// 任务详情，失败时附带错误
#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorView>,
}

#[derive(Debug, Serialize)]
pub struct JobErrorView {
    pub code: &'static str,
    pub message: String,
    pub manual_intervention: bool,
}

pub fn job_routes() -> Router<AppState> {
    Router::new().route("/:uuid", get(get_job))
}

/// GET /api/jobs/:uuid
pub async fn get_job(State(state): State<AppState>, Path(uuid): Path<Uuid>) -> ApiResult<Json<JobView>> {
    let job = state.jobs().poll(uuid).await?;
    let error = job_failure(&job).map(|err| JobErrorView {
        code: err.code(),
        manual_intervention: matches!(err, Error::JobFailed { manual_intervention: true, .. }),
        message: err.to_string(),
    });
    Ok(Json(JobView { job, error }))
}
