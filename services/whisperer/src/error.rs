use std::fmt;
use std::time::Instant;

use axum::http::{HeaderValue, StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    StatusCheck,
    AuthenticationInvalid,
    AuthorizationDenied,
    PermissionLookup,
    GroupResolution,
    ParameterParse,
    QueryExecution,
    Serialization,
}

impl FailureKind {
    pub fn status(self) -> StatusCode {
        match self {
            FailureKind::AuthenticationInvalid | FailureKind::AuthorizationDenied => {
                StatusCode::FORBIDDEN
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            FailureKind::StatusCheck => "data_status_check",
            FailureKind::AuthenticationInvalid | FailureKind::AuthorizationDenied => {
                "data_cant_view"
            }
            FailureKind::PermissionLookup | FailureKind::GroupResolution => "data_perms_error",
            FailureKind::ParameterParse => "params",
            FailureKind::QueryExecution => "data_store_error",
            FailureKind::Serialization => "data_marshal_error",
        }
    }

    /// Caller-facing text. Never carries internal detail.
    pub fn message(self) -> &'static str {
        match self {
            FailureKind::StatusCheck => "checking of the status endpoint showed an error",
            FailureKind::AuthenticationInvalid | FailureKind::AuthorizationDenied => {
                "user is not authorized to view data"
            }
            FailureKind::PermissionLookup | FailureKind::GroupResolution => {
                "error finding permissons for user"
            }
            FailureKind::ParameterParse => "incorrect parameters",
            FailureKind::QueryExecution | FailureKind::Serialization => "internal server error",
        }
    }
}

/// Structured failure. Only `status`, `id`, `code` and `message` reach the
/// caller; the internal message goes to the log.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedError {
    pub status: u16,
    pub id: String,
    pub code: &'static str,
    pub message: &'static str,
    #[serde(skip)]
    pub internal_message: Option<String>,
    #[serde(skip)]
    kind: FailureKind,
}

impl DetailedError {
    pub fn new(kind: FailureKind) -> Self {
        Self {
            status: kind.status().as_u16(),
            id: uuid::Uuid::new_v4().to_string(),
            code: kind.code(),
            message: kind.message(),
            internal_message: None,
            kind,
        }
    }

    pub fn with_internal(mut self, detail: impl fmt::Display) -> Self {
        self.internal_message = Some(detail.to_string());
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status()
    }

    pub fn log(&self, stage: &'static str, started_at: Instant) {
        let elapsed_secs = started_at.elapsed().as_secs_f64();
        let internal = self.internal_message.as_deref().unwrap_or("");
        if self.status_code().is_server_error() {
            tracing::error!(
                error_id = %self.id,
                code = self.code,
                stage,
                elapsed_secs,
                internal,
                "{}",
                self.message
            );
        } else {
            tracing::warn!(
                error_id = %self.id,
                code = self.code,
                stage,
                elapsed_secs,
                internal,
                "{}",
                self.message
            );
        }
    }

    pub fn to_body(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"status\":{},\"id\":\"{}\",\"code\":\"{}\",\"message\":\"{}\"}}",
                self.status, self.id, self.code, self.message
            )
        })
    }
}

impl fmt::Display for DetailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.code, self.id, self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, ": {internal}")?;
        }
        Ok(())
    }
}

impl IntoResponse for DetailedError {
    fn into_response(self) -> Response {
        let mut response = (self.status_code(), self.to_body()).into_response();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_internal_message() {
        let err = DetailedError::new(FailureKind::QueryExecution)
            .with_internal("connection reset by peer");
        let body: serde_json::Value =
            serde_json::from_str(&err.to_body()).expect("envelope should decode");

        let object = body.as_object().expect("envelope should be an object");
        let keys: Vec<&str> = object.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["status", "id", "code", "message"]);
        assert_eq!(body["status"], 500);
        assert_eq!(body["code"], "data_store_error");
        assert_eq!(body["message"], "internal server error");
        assert!(!err.to_body().contains("connection reset"));
    }

    #[test]
    fn each_failure_gets_a_fresh_id() {
        let first = DetailedError::new(FailureKind::AuthorizationDenied);
        let second = DetailedError::new(FailureKind::AuthorizationDenied);
        assert_ne!(first.id, second.id);
        assert!(uuid::Uuid::parse_str(&first.id).is_ok());
    }

    #[test]
    fn catalog_maps_status_and_code() {
        let cases = [
            (FailureKind::StatusCheck, 500, "data_status_check"),
            (FailureKind::AuthenticationInvalid, 403, "data_cant_view"),
            (FailureKind::AuthorizationDenied, 403, "data_cant_view"),
            (FailureKind::PermissionLookup, 500, "data_perms_error"),
            (FailureKind::GroupResolution, 500, "data_perms_error"),
            (FailureKind::ParameterParse, 500, "params"),
            (FailureKind::QueryExecution, 500, "data_store_error"),
            (FailureKind::Serialization, 500, "data_marshal_error"),
        ];
        for (kind, status, code) in cases {
            let err = DetailedError::new(kind);
            assert_eq!(err.status, status, "{kind:?}");
            assert_eq!(err.code, code, "{kind:?}");
        }
    }

    #[test]
    fn response_carries_status_and_json_content_type() {
        let response = DetailedError::new(FailureKind::AuthenticationInvalid).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
    }
}
