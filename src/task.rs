use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A background loop owned by a session. Every loop exits when `cancel`
/// fires; returning an error means the loop hit something it cannot recover
/// from.
#[async_trait]
pub trait Task {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}
