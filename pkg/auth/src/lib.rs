use std::sync::Arc;

use async_trait::async_trait;
use schema::{PermissionSet, TokenDescriptor};

pub const SESSION_TOKEN_HEADER: &str = "x-tidepool-session-token";

/// Permissions that allow reading another user's data.
pub const VIEW_PERMISSIONS: [&str; 2] = ["root", "view"];

/// Turns a session token into the identity behind it. Any failure to do so,
/// transport errors included, reads as an invalid token.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Option<TokenDescriptor>;
}

/// Supplies the gateway's own server credential for outbound calls.
pub trait TokenProvider: Send + Sync {
    fn server_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("permission lookup timed out")]
    Timeout,
    #[error("permission service unavailable: {0}")]
    Unavailable(String),
    #[error("permission service returned status {0}")]
    BadStatus(u16),
    #[error("permission service returned an undecodable body")]
    InvalidResponse,
}

#[async_trait]
pub trait PermissionLookup: Send + Sync {
    async fn user_in_group(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<PermissionSet, LookupError>;
}

#[async_trait]
impl<T: PermissionLookup + ?Sized> PermissionLookup for Arc<T> {
    async fn user_in_group(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<PermissionSet, LookupError> {
        (**self).user_in_group(user_id, group_id).await
    }
}

// ---------------------------------------------------------------------------
// Access cascade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRule {
    SelfAccess,
    ServerToken,
    GroupPermission,
}

impl AccessRule {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessRule::SelfAccess => "self_access",
            AccessRule::ServerToken => "server_token",
            AccessRule::GroupPermission => "group_permission",
        }
    }
}

/// Rules in evaluation order; the first rule that decides wins.
pub const ACCESS_CASCADE: [AccessRule; 3] = [
    AccessRule::SelfAccess,
    AccessRule::ServerToken,
    AccessRule::GroupPermission,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed(AccessRule),
    Forbidden(&'static str),
    LookupFailed(LookupError),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed(_))
    }
}

enum RuleOutcome {
    Allow,
    Forbid(&'static str),
    Fail(LookupError),
    Undecided,
}

pub fn is_self_access(requester: &TokenDescriptor, target_user_id: &str) -> bool {
    requester.subject_user_id == target_user_id
}

pub fn is_server_bypass(requester: &TokenDescriptor) -> bool {
    requester.is_server
}

pub fn grants_view(permissions: &PermissionSet) -> bool {
    VIEW_PERMISSIONS
        .iter()
        .any(|permission| permissions.grants(permission))
}

pub struct PermissionResolver<L> {
    lookup: L,
}

impl<L: PermissionLookup> PermissionResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    pub async fn can_view(
        &self,
        requester: &TokenDescriptor,
        target_user_id: &str,
    ) -> AccessDecision {
        for rule in ACCESS_CASCADE {
            match self.evaluate(rule, requester, target_user_id).await {
                RuleOutcome::Allow => {
                    tracing::debug!(
                        requester = %requester.subject_user_id,
                        target = %target_user_id,
                        rule = rule.as_str(),
                        "view access granted"
                    );
                    return AccessDecision::Allowed(rule);
                }
                RuleOutcome::Forbid(reason) => {
                    tracing::warn!(
                        requester = %requester.subject_user_id,
                        target = %target_user_id,
                        reason,
                        "view access denied"
                    );
                    return AccessDecision::Forbidden(reason);
                }
                RuleOutcome::Fail(err) => {
                    tracing::warn!(
                        requester = %requester.subject_user_id,
                        target = %target_user_id,
                        error = %err,
                        "permission lookup failed"
                    );
                    return AccessDecision::LookupFailed(err);
                }
                RuleOutcome::Undecided => {}
            }
        }
        AccessDecision::Forbidden("no access rule matched")
    }

    async fn evaluate(
        &self,
        rule: AccessRule,
        requester: &TokenDescriptor,
        target_user_id: &str,
    ) -> RuleOutcome {
        match rule {
            AccessRule::SelfAccess if is_self_access(requester, target_user_id) => {
                RuleOutcome::Allow
            }
            AccessRule::ServerToken if is_server_bypass(requester) => RuleOutcome::Allow,
            AccessRule::SelfAccess | AccessRule::ServerToken => RuleOutcome::Undecided,
            AccessRule::GroupPermission => {
                match self
                    .lookup
                    .user_in_group(&requester.subject_user_id, target_user_id)
                    .await
                {
                    Ok(permissions) if grants_view(&permissions) => RuleOutcome::Allow,
                    Ok(_) => RuleOutcome::Forbid("requester lacks root or view permission"),
                    Err(err) => RuleOutcome::Fail(err),
                }
            }
        }
    }
}
