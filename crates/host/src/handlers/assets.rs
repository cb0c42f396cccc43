//! Asset database operations

use super::HostContext;
use tether_core::error::RequestError;
use tether_core::protocol::{AssetRequest, AssetResult, Feature, FeatureSet};
use tracing::info;

pub async fn handle(
    context: &HostContext,
    features: &FeatureSet,
    request: AssetRequest,
) -> Result<AssetResult, RequestError> {
    features.require(Feature::AssetsBasic)?;

    let affected = context
        .on_ready_editor(move |editor| match &request {
            AssetRequest::Refresh => editor.refresh_assets(),
            AssetRequest::Import { path } => editor.import_asset(path),
            AssetRequest::Move { from, to } => editor.move_asset(from, to),
            AssetRequest::Delete { path } => editor.delete_asset(path),
        })
        .await?;

    if !affected.is_empty() {
        info!("Asset operation touched {} path(s)", affected.len());
    }
    Ok(AssetResult { affected })
}
