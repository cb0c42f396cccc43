//! Health check: readiness and identity in a single main-thread hop

use super::HostContext;
use crate::editor::Readiness;
use tether_core::error::RequestError;
use tether_core::protocol::{Feature, FeatureSet, HealthStatus};

pub async fn handle(
    context: &HostContext,
    features: &FeatureSet,
) -> Result<HealthStatus, RequestError> {
    features.require(Feature::Health)?;

    let uptime_ms = context.timestamp_ms();
    context
        .on_editor(move |editor| {
            let identity = editor.identity();
            let busy_reason = match editor.readiness() {
                Readiness::Ready => None,
                Readiness::Busy { reason } => Some(reason),
            };
            Ok(HealthStatus {
                ready: busy_reason.is_none(),
                host_version: identity.editor_version,
                busy_reason,
                uptime_ms,
            })
        })
        .await
}
