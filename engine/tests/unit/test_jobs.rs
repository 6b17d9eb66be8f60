//! Background jobs wrapping engine operations

use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};

use opspro_engine::deploy::model::{DeployRequest, DeploymentResponse};
use opspro_engine::errors::EngineError;
use opspro_engine::jobs::{JobQueue, JobRecord, JobStatus};
use opspro_engine::ssh::mock::MockConnector;

use crate::common::{site_host, site_zip, Harness};

async fn wait_finished(queue: &dyn JobQueue, id: &str) -> JobRecord {
    for _ in 0..200 {
        let record = queue.poll(id).await.unwrap();
        if record.status.is_finished() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not finish", id);
}

#[tokio::test]
async fn test_deploy_as_job() {
    let harness = Harness::new(MockConnector::new().with_host("10.0.3.1", site_host()));
    harness.add_resource("1", "10.0.3.1").await;
    let artifact = harness
        .app
        .orchestrator
        .artifacts()
        .save("site.zip", site_zip())
        .await
        .unwrap();

    let orchestrator = harness.app.orchestrator.clone();
    let request = DeployRequest {
        artifact_id: artifact.id,
        target_resource_ids: vec!["1".to_string()],
        options: Default::default(),
    };
    let job = async move {
        let response = orchestrator.deploy(request).await?;
        Ok::<_, EngineError>(serde_json::to_value(response)?)
    }
    .boxed();

    let id = harness.app.jobs.submit("deploy", job).await.unwrap();
    let record = wait_finished(harness.app.jobs.as_ref(), &id).await;

    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.name, "deploy");
    assert!(record.finished_at.unwrap() >= record.started_at.unwrap());
    let response: DeploymentResponse = serde_json::from_value(record.output.unwrap()).unwrap();
    assert!(response.success);
    assert_eq!(response.results[0].steps.len(), 7);
}

#[tokio::test]
async fn test_panicking_job_is_recorded_as_failed() {
    let harness = Harness::new(MockConnector::new());

    let id = harness
        .app
        .jobs
        .submit(
            "broken",
            async {
                if true {
                    panic!("step table corrupted");
                }
                Ok::<Value, EngineError>(json!(null))
            }
            .boxed(),
        )
        .await
        .unwrap();

    let record = wait_finished(harness.app.jobs.as_ref(), &id).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.is_some());

    // The runner keeps serving after a panic
    let next = harness
        .app
        .jobs
        .submit("next", async { Ok::<_, EngineError>(json!("ok")) }.boxed())
        .await
        .unwrap();
    assert_eq!(wait_finished(harness.app.jobs.as_ref(), &next).await.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_shutdown_waits_for_running_jobs() {
    let harness = Harness::new(MockConnector::new());

    let id = harness
        .app
        .jobs
        .submit(
            "slow",
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, EngineError>(json!("done"))
            }
            .boxed(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    harness.app.shutdown().await.unwrap();

    let record = harness.app.jobs.poll(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(record.output, Some(json!("done")));
}
