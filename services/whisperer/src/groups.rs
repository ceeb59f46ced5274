use async_trait::async_trait;
use schema::GroupId;

/// Maps a user to the storage partition that holds their records. Every
/// failure mode reads as `None`; callers never fall back to a default group.
#[async_trait]
pub trait GroupResolver: Send + Sync {
    async fn resolve_group_id(&self, target_user_id: &str, server_token: &str) -> Option<GroupId>;
}
