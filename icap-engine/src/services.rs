//! Adaptation services shipped with the engine.
//!
//! Listeners pick one by the `handler` name of their configuration.

mod echo;
mod preview;

pub use echo::EchoService;
pub use preview::PreviewService;

use crate::error::{Error, IcapResult};
use crate::service::AdaptationService;
use std::sync::Arc;

/// Handler names accepted by [`build`].
pub const KINDS: &[&str] = &["echo", "preview"];

pub fn build(kind: &str) -> IcapResult<Arc<dyn AdaptationService>> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "echo" => Ok(Arc::new(EchoService)),
        "preview" => Ok(Arc::new(PreviewService)),
        other => Err(Error::configuration(format!(
            "unknown service handler {other:?}, expected one of {KINDS:?}"
        ))),
    }
}
