use crate::error::IcapResult;
use crate::response::StatusCode;
use crate::service::{AdaptationService, Exchange, VectoringPoint};
use async_trait::async_trait;
use tracing::trace;

/// Accepts every response after looking at its preview.
///
/// Answers `204` whenever the client allows it and falls back to the
/// unmodified message otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreviewService;

#[async_trait]
impl AdaptationService for PreviewService {
    fn name(&self) -> &str {
        "preview"
    }

    fn description(&self) -> &str {
        "accepts responses after their preview"
    }

    fn supported_modes(&self) -> VectoringPoint {
        VectoringPoint::RespMod
    }

    async fn respond(&self, exchange: &mut Exchange<'_>) -> IcapResult<StatusCode> {
        trace!(
            status = exchange.state().http_status(),
            preview = exchange.state().body().len(),
            "preview inspected"
        );
        exchange.early_response().await
    }
}
