use crate::error::IcapResult;
use crate::response::StatusCode;
use crate::service::{AdaptationService, Exchange, VectoringPoint};
use async_trait::async_trait;

/// Returns every message unmodified, always with a full `200 OK`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoService;

#[async_trait]
impl AdaptationService for EchoService {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echoes requests and responses unmodified"
    }

    fn supported_modes(&self) -> VectoringPoint {
        VectoringPoint::ReqModRespMod
    }

    async fn respond(&self, exchange: &mut Exchange<'_>) -> IcapResult<StatusCode> {
        exchange.get_all_body().await?;
        Ok(exchange.full_response())
    }
}
