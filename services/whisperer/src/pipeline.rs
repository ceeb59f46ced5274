use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use auth::{AccessDecision, PermissionLookup, PermissionResolver, SessionValidator, TokenProvider};
use schema::SchemaVersionRange;
use store::{Projection, StorePool};
use tokio::time::timeout;
use tracing::Instrument;

use crate::error::{DetailedError, FailureKind};
use crate::groups::GroupResolver;
use crate::metrics;
use crate::query::{DataQueryParams, build_query};
use crate::stream::{ArrayWriter, ResponseSink, stream_records};

/// Progress of one data request. Each variant names the last transition
/// that succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    TokenValidated,
    Authorized,
    GroupResolved,
    FilterBuilt,
    Streaming,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::TokenValidated => "token_validated",
            Stage::Authorized => "authorized",
            Stage::GroupResolved => "group_resolved",
            Stage::FilterBuilt => "filter_built",
            Stage::Streaming => "streaming",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub schema_versions: SchemaVersionRange,
    pub upstream_timeout: Duration,
    pub store_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct DataRequest {
    pub target_user_id: String,
    pub session_token: Option<String>,
    pub params: DataQueryParams,
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub stage: Stage,
    pub emitted: usize,
    pub error: Option<DetailedError>,
}

/// Process-wide request context, built once at startup.
pub struct Gateway {
    sessions: Arc<dyn SessionValidator>,
    server_tokens: Arc<dyn TokenProvider>,
    permissions: PermissionResolver<Arc<dyn PermissionLookup>>,
    groups: Arc<dyn GroupResolver>,
    pool: StorePool,
    projection: Projection,
    settings: PipelineSettings,
}

fn failure(kind: FailureKind, detail: impl fmt::Display) -> DetailedError {
    DetailedError::new(kind).with_internal(detail)
}

impl Gateway {
    pub fn new(
        sessions: Arc<dyn SessionValidator>,
        server_tokens: Arc<dyn TokenProvider>,
        permissions: Arc<dyn PermissionLookup>,
        groups: Arc<dyn GroupResolver>,
        pool: StorePool,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            sessions,
            server_tokens,
            permissions: PermissionResolver::new(permissions),
            groups,
            pool,
            projection: Projection::internal_fields(),
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn pool(&self) -> &StorePool {
        &self.pool
    }

    /// Checks out a store session and pings it.
    pub async fn check_status(&self) -> Result<(), DetailedError> {
        let limit = self.settings.store_timeout;
        let session = match timeout(limit, self.pool.checkout()).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(failure(FailureKind::StatusCheck, err)),
            Err(_) => return Err(failure(FailureKind::StatusCheck, "store checkout timed out")),
        };
        match timeout(limit, session.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(failure(FailureKind::StatusCheck, err)),
            Err(_) => Err(failure(FailureKind::StatusCheck, "store ping timed out")),
        }
    }

    /// Runs one data request to completion. Failures before the response is
    /// committed become an error envelope; later ones only reach logs and
    /// metrics.
    pub async fn serve_data<S: ResponseSink>(
        &self,
        request: DataRequest,
        sink: S,
    ) -> PipelineOutcome {
        let started_at = Instant::now();
        let span = tracing::info_span!("data_request", target_user = %request.target_user_id);
        let mut writer = ArrayWriter::new(sink);
        let mut stage = Stage::Start;

        async {
            match self.run(&request, &mut writer, &mut stage, started_at).await {
                Ok(emitted) => PipelineOutcome {
                    stage,
                    emitted,
                    error: None,
                },
                Err(err) => {
                    err.log(stage.as_str(), started_at);
                    metrics::observe_pipeline_failure(stage.as_str(), err.code);
                    if !writer.is_committed() && writer.reject(&err).await.is_err() {
                        tracing::debug!(error_id = %err.id, "client gone before error response");
                    }
                    PipelineOutcome {
                        stage,
                        emitted: writer.emitted(),
                        error: Some(err),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run<S: ResponseSink>(
        &self,
        request: &DataRequest,
        writer: &mut ArrayWriter<S>,
        stage: &mut Stage,
        started_at: Instant,
    ) -> Result<usize, DetailedError> {
        let upstream = self.settings.upstream_timeout;
        let target = request.target_user_id.as_str();
        tracing::debug!(params = ?request.params, "data request received");

        let token = request
            .session_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| failure(FailureKind::AuthenticationInvalid, "missing session token"))?;
        let requester = match timeout(upstream, self.sessions.validate(token)).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                return Err(failure(
                    FailureKind::AuthenticationInvalid,
                    "session token rejected",
                ));
            }
            Err(_) => {
                return Err(failure(
                    FailureKind::AuthenticationInvalid,
                    "session validation timed out",
                ));
            }
        };
        *stage = Stage::TokenValidated;

        match timeout(upstream, self.permissions.can_view(&requester, target)).await {
            Ok(AccessDecision::Allowed(rule)) => {
                tracing::debug!(requester = %requester.subject_user_id, rule = rule.as_str(), "access granted");
            }
            Ok(AccessDecision::Forbidden(reason)) => {
                return Err(failure(
                    FailureKind::AuthorizationDenied,
                    format_args!("{} may not view {target}: {reason}", requester.subject_user_id),
                ));
            }
            Ok(AccessDecision::LookupFailed(err)) => {
                return Err(failure(FailureKind::PermissionLookup, err));
            }
            Err(_) => {
                return Err(failure(
                    FailureKind::PermissionLookup,
                    "permission lookup timed out",
                ));
            }
        }
        *stage = Stage::Authorized;

        let server_token = self.server_tokens.server_token().unwrap_or_default();
        let group_id = match timeout(upstream, self.groups.resolve_group_id(target, &server_token)).await {
            Ok(Some(group_id)) => group_id,
            Ok(None) => {
                return Err(failure(
                    FailureKind::GroupResolution,
                    format_args!("no group id for user {target}"),
                ));
            }
            Err(_) => {
                return Err(failure(
                    FailureKind::GroupResolution,
                    "group lookup timed out",
                ));
            }
        };
        *stage = Stage::GroupResolved;

        let filter = build_query(group_id, self.settings.schema_versions, &request.params)
            .map_err(|err| failure(FailureKind::ParameterParse, err))?;
        tracing::debug!(filter = %filter.to_json(), "query filter built");
        *stage = Stage::FilterBuilt;

        let limit = self.settings.store_timeout;
        let session = match timeout(limit, self.pool.checkout()).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(failure(FailureKind::QueryExecution, err)),
            Err(_) => {
                return Err(failure(
                    FailureKind::QueryExecution,
                    "store checkout timed out",
                ));
            }
        };
        let cursor = match timeout(limit, session.find(&filter, &self.projection)).await {
            Ok(Ok(cursor)) => cursor,
            Ok(Err(err)) => return Err(failure(FailureKind::QueryExecution, err)),
            Err(_) => return Err(failure(FailureKind::QueryExecution, "query timed out")),
        };

        *stage = Stage::Streaming;
        tracing::info!(
            elapsed_secs = started_at.elapsed().as_secs_f64(),
            "streaming data"
        );
        let report = stream_records(cursor, writer, &self.projection, limit).await;
        drop(session);

        metrics::observe_records_streamed(report.emitted);
        if let Some(err) = &report.close_error {
            metrics::observe_stream_failure("cursor_close");
            failure(FailureKind::QueryExecution, format_args!("cursor close failed: {err}"))
                .log(Stage::Streaming.as_str(), started_at);
        }
        if let Some(stream_failure) = report.failure {
            metrics::observe_stream_failure(stream_failure.kind());
            match stream_failure.to_detailed() {
                // Nothing sent yet; the caller still gets the envelope.
                Some(err) if !writer.is_committed() => return Err(err),
                Some(err) => err.log(Stage::Streaming.as_str(), started_at),
                None => tracing::info!(emitted = report.emitted, "client disconnected mid-stream"),
            }
        }

        *stage = Stage::Done;
        tracing::info!(
            elapsed_secs = started_at.elapsed().as_secs_f64(),
            emitted = report.emitted,
            "data request complete"
        );
        Ok(report.emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tests::{Head, RecordingSink, ScriptedCursor};
    use async_trait::async_trait;
    use auth::LookupError;
    use schema::{GroupId, PermissionSet, QueryFilter, TokenDescriptor, record_from_json};
    use serde_json::json;
    use store::{Cursor, DocumentStore, MemoryStore, StoreError};

    struct FixedSessions;

    #[async_trait]
    impl SessionValidator for FixedSessions {
        async fn validate(&self, token: &str) -> Option<TokenDescriptor> {
            match token {
                "patient-token" => Some(TokenDescriptor::user("patient")),
                "care-token" => Some(TokenDescriptor::user("care")),
                "server-token" => Some(TokenDescriptor::server("svc")),
                "slow-token" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    None
                }
                _ => None,
            }
        }
    }

    struct FixedServerToken;

    impl TokenProvider for FixedServerToken {
        fn server_token(&self) -> Option<String> {
            Some("gateway-token".to_string())
        }
    }

    struct NoPermissions;

    #[async_trait]
    impl PermissionLookup for NoPermissions {
        async fn user_in_group(&self, _: &str, _: &str) -> Result<PermissionSet, LookupError> {
            Ok(PermissionSet::new())
        }
    }

    struct OneGroup;

    #[async_trait]
    impl GroupResolver for OneGroup {
        async fn resolve_group_id(&self, target: &str, token: &str) -> Option<GroupId> {
            assert_eq!(token, "gateway-token");
            (target == "patient").then(|| GroupId::new("g-patient"))
        }
    }

    struct SlowPermissions;

    #[async_trait]
    impl PermissionLookup for SlowPermissions {
        async fn user_in_group(&self, _: &str, _: &str) -> Result<PermissionSet, LookupError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(PermissionSet::new().grant("view"))
        }
    }

    struct SlowGroups;

    #[async_trait]
    impl GroupResolver for SlowGroups {
        async fn resolve_group_id(&self, _: &str, _: &str) -> Option<GroupId> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Some(GroupId::new("g-patient"))
        }
    }

    /// Opens cursors that fail on their first read.
    struct BrokenCursorStore;

    #[async_trait]
    impl DocumentStore for BrokenCursorStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn find(&self, _: &QueryFilter, _: &Projection) -> Result<Box<dyn Cursor>, StoreError> {
            let (cursor, _, _) =
                ScriptedCursor::new(vec![Err(StoreError::Cursor("db down".into()))]);
            Ok(cursor)
        }
    }

    fn gateway(store: MemoryStore) -> Gateway {
        gateway_with(Arc::new(NoPermissions), Arc::new(OneGroup), Arc::new(store))
    }

    fn gateway_with(
        permissions: Arc<dyn PermissionLookup>,
        groups: Arc<dyn GroupResolver>,
        store: Arc<dyn DocumentStore>,
    ) -> Gateway {
        Gateway::new(
            Arc::new(FixedSessions),
            Arc::new(FixedServerToken),
            permissions,
            groups,
            StorePool::new(store, 2),
            PipelineSettings {
                schema_versions: SchemaVersionRange::new(0, 99).expect("valid range"),
                upstream_timeout: Duration::from_millis(100),
                store_timeout: Duration::from_secs(1),
            },
        )
    }

    fn patient_store() -> MemoryStore {
        MemoryStore::with_documents(vec![
            record_from_json(json!({
                "_groupId": "g-patient", "_active": true, "_schemaVersion": 1,
                "type": "smbg", "value": 5.5, "time": "2015-10-01T00:00:00.000Z"
            }))
            .expect("fixture"),
        ])
    }

    fn request(target: &str, token: Option<&str>) -> DataRequest {
        DataRequest {
            target_user_id: target.to_string(),
            session_token: token.map(str::to_string),
            params: DataQueryParams::default(),
        }
    }

    async fn serve(gateway: &Gateway, request: DataRequest) -> (PipelineOutcome, RecordingSink) {
        let mut sink = RecordingSink::default();
        let outcome = gateway.serve_data(request, &mut sink).await;
        (outcome, sink)
    }

    #[tokio::test]
    async fn self_request_streams_to_done() {
        let gateway = gateway(patient_store());
        let (outcome, sink) = serve(&gateway, request("patient", Some("patient-token"))).await;

        assert_eq!(outcome.stage, Stage::Done);
        assert_eq!(outcome.emitted, 1);
        assert_eq!(sink.body(), "[{\"type\":\"smbg\",\"value\":5.5,\"time\":\"2015-10-01T00:00:00.000Z\"}]");
        assert_eq!(gateway.pool().available(), 2);
    }

    #[tokio::test]
    async fn missing_token_stops_at_start() {
        let gateway = gateway(patient_store());
        let (outcome, sink) = serve(&gateway, request("patient", None)).await;

        assert_eq!(outcome.stage, Stage::Start);
        assert_eq!(sink.head, Some(Head::Rejected(403, "data_cant_view".into())));
    }

    #[tokio::test]
    async fn validator_timeout_reads_as_invalid_token() {
        let gateway = gateway(patient_store());
        let (outcome, sink) = serve(&gateway, request("patient", Some("slow-token"))).await;

        assert_eq!(outcome.stage, Stage::Start);
        assert_eq!(sink.head, Some(Head::Rejected(403, "data_cant_view".into())));
    }

    #[tokio::test]
    async fn denied_viewer_stops_after_token_validation() {
        let gateway = gateway(patient_store());
        let (outcome, sink) = serve(&gateway, request("patient", Some("care-token"))).await;

        assert_eq!(outcome.stage, Stage::TokenValidated);
        assert_eq!(sink.head, Some(Head::Rejected(403, "data_cant_view".into())));
    }

    #[tokio::test]
    async fn unknown_group_is_a_permissions_error() {
        let gateway = gateway(patient_store());
        let (outcome, sink) = serve(&gateway, request("stranger", Some("server-token"))).await;

        assert_eq!(outcome.stage, Stage::Authorized);
        assert_eq!(sink.head, Some(Head::Rejected(500, "data_perms_error".into())));
    }

    #[tokio::test]
    async fn bad_date_stops_after_group_resolution() {
        let gateway = gateway(patient_store());
        let mut req = request("patient", Some("patient-token"));
        req.params.start_date = Some("not-a-date".into());
        let (outcome, sink) = serve(&gateway, req).await;

        assert_eq!(outcome.stage, Stage::GroupResolved);
        assert_eq!(sink.head, Some(Head::Rejected(500, "params".into())));
        let err = outcome.error.expect("error recorded");
        assert!(
            err.internal_message
                .as_deref()
                .is_some_and(|detail| detail.contains("not-a-date"))
        );
    }

    #[tokio::test]
    async fn permission_lookup_timeout_is_a_permissions_error() {
        let gateway = gateway_with(
            Arc::new(SlowPermissions),
            Arc::new(OneGroup),
            Arc::new(patient_store()),
        );
        let (outcome, sink) = serve(&gateway, request("patient", Some("care-token"))).await;

        assert_eq!(outcome.stage, Stage::TokenValidated);
        assert_eq!(sink.head, Some(Head::Rejected(500, "data_perms_error".into())));
    }

    #[tokio::test]
    async fn group_lookup_timeout_is_a_permissions_error() {
        let gateway = gateway_with(
            Arc::new(NoPermissions),
            Arc::new(SlowGroups),
            Arc::new(patient_store()),
        );
        let (outcome, sink) = serve(&gateway, request("patient", Some("patient-token"))).await;

        assert_eq!(outcome.stage, Stage::Authorized);
        assert_eq!(sink.head, Some(Head::Rejected(500, "data_perms_error".into())));
    }

    #[tokio::test]
    async fn cursor_failure_before_first_record_sends_store_error() {
        let gateway = gateway_with(
            Arc::new(NoPermissions),
            Arc::new(OneGroup),
            Arc::new(BrokenCursorStore),
        );
        let (outcome, sink) = serve(&gateway, request("patient", Some("patient-token"))).await;

        assert_eq!(outcome.stage, Stage::Streaming);
        assert_eq!(outcome.emitted, 0);
        assert_eq!(sink.head, Some(Head::Rejected(500, "data_store_error".into())));
        assert!(sink.chunks.is_empty());
        assert_eq!(gateway.pool().available(), 2);
    }

    #[tokio::test]
    async fn status_pings_store() {
        let gateway = gateway(MemoryStore::new());
        assert!(gateway.check_status().await.is_ok());

        gateway.pool().close();
        let err = gateway.check_status().await.expect_err("closed pool fails status");
        assert_eq!(err.code, "data_status_check");
    }
}
