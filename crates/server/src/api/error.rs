/// API 错误响应

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::{Error, FieldError};
use serde::Serialize;
use tracing::error;

/// 错误响应体
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub errors: Vec<FieldError>,
}

#[derive(Debug)]
pub enum ApiError {
    /// 领域错误，按分类映射状态码
    Domain(Error),
    /// 请求无法解析
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Domain(err) => match err {
                Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
                Error::ValidationFailed { .. } | Error::InsufficientCapacity { .. } => StatusCode::CONFLICT,
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Domain(err)
    }
}

impl From<FieldError> for ApiError {
    fn from(err: FieldError) -> Self {
        ApiError::Domain(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<FieldError> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let message = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("{} is invalid ({})", field, e.code));
                    FieldError::invalid(field, message)
                })
            })
            .collect();
        fields.sort_by(|a, b| a.field.cmp(&b.field));

        let message = fields
            .first()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| "Invalid parameters".to_string());
        ApiError::Domain(Error::ValidationFailed {
            message,
            errors: fields,
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::BadRequest(message) => ErrorResponse {
                code: "InvalidArgument".to_string(),
                message,
                errors: Vec::new(),
            },
            ApiError::Domain(err) => {
                if status.is_server_error() {
                    error!("请求处理失败: {}", err);
                }
                ErrorResponse {
                    code: err.code().to_string(),
                    message: err.to_string(),
                    errors: err.field_errors(),
                }
            }
        };

        (status, Json(body)).into_response()
    }
}
