//! Player and bundle builds
//!
//! A build publishes its lifecycle as operation events: `Started` before the
//! dispatcher hop, `Progress` from inside the editor's build loop, then
//! exactly one of `Completed` or `Failed`.

use super::HostContext;
use crate::editor::BuildJob;
use std::time::Instant;
use tether_core::error::RequestError;
use tether_core::protocol::{BuildReport, BuildRequest, Feature, FeatureSet, OperationStage};
use tracing::{info, warn};

pub async fn handle(
    context: &HostContext,
    features: &FeatureSet,
    request: BuildRequest,
) -> Result<BuildReport, RequestError> {
    features.require(Feature::BuildMinimal)?;

    let job = match request {
        BuildRequest::Player {
            target,
            output_path,
            development,
        } => BuildJob::Player {
            target,
            output_path,
            development,
        },
        BuildRequest::Bundles {
            target,
            output_path,
        } => BuildJob::Bundles {
            target,
            output_path,
        },
    };

    let operation_id = context.next_operation_id();
    let name = job.operation_name();
    let started = Instant::now();
    info!("{} {} for {} started", operation_id, name, job.target());
    context.publish_operation(&operation_id, name, OperationStage::Started);

    let progress_context = context.clone();
    let progress_id = operation_id.clone();
    let build_job = job.clone();
    let outcome = context
        .on_ready_editor(move |editor| {
            editor.build(&build_job, &mut |fraction, detail| {
                progress_context.publish_operation(
                    &progress_id,
                    name,
                    OperationStage::Progress {
                        fraction,
                        detail: detail.to_string(),
                    },
                );
            })
        })
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!("{} {} failed: {}", operation_id, name, error);
            context.publish_operation(
                &operation_id,
                name,
                OperationStage::Failed {
                    message: error.to_string(),
                },
            );
            return Err(error);
        }
    };

    let stage = if outcome.success {
        OperationStage::Completed
    } else {
        OperationStage::Failed {
            message: "the build finished with errors".to_string(),
        }
    };
    context.publish_operation(&operation_id, name, stage);

    Ok(BuildReport {
        operation_id,
        target: job.target().to_string(),
        output_path: job.output_path().to_string(),
        success: outcome.success,
        duration_ms: started.elapsed().as_millis() as u64,
        size_bytes: outcome.size_bytes,
        warnings: outcome.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::HeadlessEditor;
    use crate::handlers::test_support::fixture;
    use tether_core::protocol::EventKind;

    fn stages(subscription: &mut tether_core::EventSubscription) -> Vec<OperationStage> {
        let mut stages = Vec::new();
        while let Some(event) = subscription.try_recv() {
            if let EventKind::Operation(op) = event.kind {
                stages.push(op.stage);
            }
        }
        stages
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_publishes_lifecycle() {
        let fx = fixture(HeadlessEditor::new("demo").with_assets(["Assets/a.png"]));
        let mut events = fx.context.events().subscribe();

        let report = handle(
            &fx.context,
            &FeatureSet::all(),
            BuildRequest::Player {
                target: "linux64".to_string(),
                output_path: "Builds/demo".to_string(),
                development: true,
            },
        )
        .await
        .unwrap();

        assert!(report.success);
        assert_eq!(report.operation_id, "op-1");
        let stages = stages(&mut events);
        assert_eq!(stages.first(), Some(&OperationStage::Started));
        assert_eq!(stages.last(), Some(&OperationStage::Completed));
        assert_eq!(
            stages
                .iter()
                .filter(|s| matches!(s, OperationStage::Progress { .. }))
                .count(),
            3
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_build_publishes_failure() {
        let fx = fixture(HeadlessEditor::new("demo"));
        let mut events = fx.context.events().subscribe();

        let err = handle(
            &fx.context,
            &FeatureSet::all(),
            BuildRequest::Bundles {
                target: "dreamcast".to_string(),
                output_path: "Builds/bundles".to_string(),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RequestError::InvalidRequest { .. }));
        let stages = stages(&mut events);
        assert_eq!(stages.len(), 2);
        assert!(matches!(stages[1], OperationStage::Failed { .. }));
    }
}
