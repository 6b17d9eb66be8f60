//! Batch deploy, rollback and agent rollout against scripted hosts

use std::time::Duration;

use secrecy::SecretString;

use opspro_engine::deploy::model::{
    AgentDeployRequest, DeployFlags, DeployRequest, ExecutionStatus, Operation, RollbackRequest,
};
use opspro_engine::deploy::StepStatus;
use opspro_engine::errors::EngineError;
use opspro_engine::ssh::mock::{MockConnector, MockHost, MockReply};

use crate::common::{site_host, site_zip, Harness};

const HOST_A: &str = "10.0.1.1";
const HOST_B: &str = "10.0.1.2";

const SITE_STEPS: [&str; 7] = [
    "connect",
    "backup-current",
    "prune-backups",
    "upload-artifact",
    "extract-install",
    "start-service",
    "health-check",
];

async fn upload(harness: &Harness) -> String {
    harness
        .app
        .orchestrator
        .artifacts()
        .save("site.zip", site_zip())
        .await
        .unwrap()
        .id
}

fn deploy_request(artifact_id: String, ids: &[&str], ha: bool) -> DeployRequest {
    DeployRequest {
        artifact_id,
        target_resource_ids: ids.iter().map(|id| id.to_string()).collect(),
        options: DeployFlags {
            restart_shared_daemon: ha,
        },
    }
}

#[tokio::test]
async fn test_deploy_single_target() {
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, site_host()));
    harness.add_resource("1", HOST_A).await;
    let artifact_id = upload(&harness).await;

    let response = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id, &["1"], false))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.operation, Operation::Deploy);
    let result = response.result_for("1").unwrap();
    assert_eq!(result.step_names(), SITE_STEPS.to_vec());
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(result.target_label, "web-1");

    let uploads = harness.connector.uploads(HOST_A);
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].0.starts_with("/tmp/deploy_"));
    assert_eq!(uploads[0].1, site_zip().len());

    let commands = harness.connector.commands(HOST_A);
    assert!(commands.iter().any(|c| c.contains("docker-compose restart 'start_nginx'")));
    assert!(commands.iter().all(|c| !c.contains("keepalived")));
    assert_eq!(harness.connector.open_sessions(), 0);

    let records = harness.store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(records[0].steps.len(), SITE_STEPS.len());
}

#[tokio::test]
async fn test_one_failing_target_does_not_stop_the_other() {
    let failing = site_host().on("docker-compose restart", MockReply::fail(1, "no such service: start_nginx"));
    let connector = MockConnector::new()
        .with_host(HOST_A, site_host())
        .with_host(HOST_B, failing);
    let harness = Harness::new(connector);
    harness.add_resource("a", HOST_A).await;
    harness.add_resource("b", HOST_B).await;
    let artifact_id = upload(&harness).await;

    let response = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id, &["a", "b"], true))
        .await
        .unwrap();

    assert!(!response.success);

    let a = response.result_for("a").unwrap();
    assert!(a.success);
    assert_eq!(a.step_names(), SITE_STEPS.to_vec());

    let b = response.result_for("b").unwrap();
    assert!(!b.success);
    assert_eq!(b.step_names(), SITE_STEPS[..6].to_vec());
    let last = b.steps.last().unwrap();
    assert_eq!(last.status, StepStatus::Failed);
    assert!(last.message.contains("no such service"));
    assert!(b.error.as_deref().unwrap().starts_with("step 'start-service' failed"));

    // The pair did not both succeed, so the shared daemon is left alone
    for result in &response.results {
        assert!(result.step("restart-failover-daemon").is_none());
    }
    for host in [HOST_A, HOST_B] {
        assert!(harness.connector.commands(host).iter().all(|c| !c.contains("keepalived")));
    }

    let records = harness.store.records().await;
    assert_eq!(records[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_ha_pair_restarts_failover_daemon_on_both() {
    let connector = MockConnector::new()
        .with_host(HOST_A, site_host())
        .with_host(HOST_B, site_host());
    let harness = Harness::new(connector);
    harness.add_resource("a", HOST_A).await;
    harness.add_resource("b", HOST_B).await;
    let artifact_id = upload(&harness).await;

    let response = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id, &["a", "b"], true))
        .await
        .unwrap();

    assert!(response.success);
    for (id, host) in [("a", HOST_A), ("b", HOST_B)] {
        let result = response.result_for(id).unwrap();
        assert_eq!(result.steps.last().unwrap().step_name, "restart-failover-daemon");
        assert_eq!(result.steps.len(), SITE_STEPS.len() + 1);
        let commands = harness.connector.commands(host);
        assert_eq!(commands.last().unwrap(), "systemctl restart 'keepalived'");
    }
}

#[tokio::test]
async fn test_ha_requires_exactly_two_targets() {
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, site_host()));
    harness.add_resource("a", HOST_A).await;
    let artifact_id = upload(&harness).await;

    let result = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id, &["a"], true))
        .await;

    assert!(matches!(result, Err(EngineError::ValidationError(_))));
    assert_eq!(harness.connector.connect_count(), 0);
}

#[tokio::test]
async fn test_batch_validation() {
    let harness = Harness::with_options(MockConnector::new(), |options| {
        options.orchestrator.max_batch_size = 2;
    });
    let artifact_id = upload(&harness).await;

    let empty = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id.clone(), &[], false))
        .await;
    assert!(matches!(empty, Err(EngineError::ValidationError(_))));

    let too_many = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id.clone(), &["1", "2", "3"], false))
        .await;
    assert!(matches!(too_many, Err(EngineError::ValidationError(_))));

    let duplicate = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id.clone(), &["1", "1"], false))
        .await;
    assert!(matches!(duplicate, Err(EngineError::ValidationError(_))));

    let unknown = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id, &["404"], false))
        .await;
    assert!(matches!(unknown, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_unreachable_target_fails_at_connect() {
    let connector = MockConnector::new()
        .with_host(HOST_A, site_host())
        .with_host(HOST_B, MockHost::unreachable());
    let harness = Harness::new(connector);
    harness.add_resource("a", HOST_A).await;
    harness.add_resource("b", HOST_B).await;
    let artifact_id = upload(&harness).await;

    let response = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id, &["a", "b"], false))
        .await
        .unwrap();

    assert!(response.result_for("a").unwrap().success);
    let b = response.result_for("b").unwrap();
    assert_eq!(b.step_names(), vec!["connect"]);
    assert_eq!(b.steps[0].status, StepStatus::Failed);
    assert!(b.steps[0].message.contains("no route to host"));
}

#[tokio::test]
async fn test_failed_extract_restores_backup() {
    let host = site_host().on("index.html not found", MockReply::fail(1, "index.html not found in package"));
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, host));
    harness.add_resource("1", HOST_A).await;
    let artifact_id = upload(&harness).await;

    let response = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id, &["1"], false))
        .await
        .unwrap();

    let result = response.result_for("1").unwrap();
    assert_eq!(result.steps.last().unwrap().step_name, "extract-install");
    assert!(result.steps.last().unwrap().message.contains("restored from backup"));
    let commands = harness.connector.commands(HOST_A);
    assert!(commands.last().unwrap().starts_with("rm -rf '/usr/local/nginx/html'/* && tar -xzf"));
}

#[tokio::test]
async fn test_rollback_is_repeatable() {
    let host = site_host().on("then echo found", MockReply::ok("found\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, host));
    harness.add_resource("1", HOST_A).await;

    let request = RollbackRequest {
        target_resource_id: "1".to_string(),
        backup_name: "html_20240501_101500.tar.gz".to_string(),
        restart_shared_daemon: false,
    };
    let first = harness.app.orchestrator.rollback(request.clone()).await.unwrap();
    let second = harness.app.orchestrator.rollback(request).await.unwrap();

    assert!(first.success);
    assert!(second.success);
    assert_eq!(first.operation, Operation::Rollback);
    let expected = vec![
        "connect",
        "locate-backup",
        "stop-service",
        "restore-artifact",
        "start-service",
        "health-check",
    ];
    assert_eq!(first.results[0].step_names(), expected);
    assert_eq!(second.results[0].step_names(), expected);
    assert_eq!(harness.store.records().await.len(), 2);
}

#[tokio::test]
async fn test_rollback_restarts_failover_daemon() {
    let host = site_host().on("then echo found", MockReply::ok("found\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, host));
    harness.add_resource("1", HOST_A).await;

    let response = harness
        .app
        .orchestrator
        .rollback(RollbackRequest {
            target_resource_id: "1".to_string(),
            backup_name: "html_20240501_101500.tar.gz".to_string(),
            restart_shared_daemon: true,
        })
        .await
        .unwrap();

    assert!(response.success);
    let result = &response.results[0];
    assert_eq!(result.step_names().last().copied(), Some("restart-failover-daemon"));
    assert_eq!(
        harness.connector.commands(HOST_A).last().map(String::as_str),
        Some("systemctl restart 'keepalived'")
    );
}

#[tokio::test]
async fn test_rollback_missing_backup() {
    let host = site_host().on("then echo found", MockReply::ok("missing\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, host));
    harness.add_resource("1", HOST_A).await;

    let response = harness
        .app
        .orchestrator
        .rollback(RollbackRequest {
            target_resource_id: "1".to_string(),
            backup_name: "html_20240501_101500.tar.gz".to_string(),
            restart_shared_daemon: false,
        })
        .await
        .unwrap();

    let result = &response.results[0];
    assert_eq!(result.step_names(), vec!["connect", "locate-backup"]);
    assert!(result.steps[1].message.contains("expected 'found'"));
    assert!(harness.connector.commands(HOST_A).iter().all(|c| !c.contains("docker-compose stop")));
}

#[tokio::test]
async fn test_rollback_rejects_unsafe_backup_name() {
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, site_host()));
    harness.add_resource("1", HOST_A).await;

    let result = harness
        .app
        .orchestrator
        .rollback(RollbackRequest {
            target_resource_id: "1".to_string(),
            backup_name: "../../etc/passwd".to_string(),
            restart_shared_daemon: false,
        })
        .await;

    assert!(matches!(result, Err(EngineError::ValidationError(_))));
    assert_eq!(harness.connector.connect_count(), 0);
}

#[tokio::test]
async fn test_list_backups_newest_first() {
    let listing = "2048 /usr/local/nginx/backups/html_20240101_080000.tar.gz\n\
                   4096 /usr/local/nginx/backups/html_20240301_090000.tar.gz\n\
                   10 /usr/local/nginx/backups/notes.txt\n";
    let host = MockHost::new().on("stat -c", MockReply::ok(listing));
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, host));
    harness.add_resource("1", HOST_A).await;

    let backups = harness.app.orchestrator.list_backups("1").await.unwrap();

    assert_eq!(backups.len(), 2);
    assert_eq!(backups[0].name, "html_20240301_090000.tar.gz");
    assert_eq!(backups[0].size, 4096);
    assert_eq!(backups[0].created_at, "2024-03-01 09:00:00");
    assert_eq!(harness.connector.open_sessions(), 0);
}

#[tokio::test]
async fn test_agent_rollout() {
    let host = MockHost::new()
        .on("uname -m", MockReply::ok("x86_64\n"))
        .on("systemctl is-active", MockReply::ok("active\n"));
    let harness = Harness::with_options(MockConnector::new().with_host(HOST_A, host), |options| {
        options.orchestrator.agent_token_secret = Some(SecretString::from("signing-secret"));
    });
    harness.add_resource("1", HOST_A).await;

    let bundles = harness.options.layout.agent_bundle_dir();
    bundles.create().await.unwrap();
    tokio::fs::write(bundles.path().join("alloy-linux-amd64.zip"), b"amd64 bundle")
        .await
        .unwrap();
    tokio::fs::write(bundles.path().join("alloy-linux-arm64.zip"), b"arm64 bundle!")
        .await
        .unwrap();

    let response = harness
        .app
        .orchestrator
        .deploy_agent(AgentDeployRequest {
            target_resource_ids: vec!["1".to_string()],
        })
        .await
        .unwrap();

    assert!(response.success, "{:?}", response.results);
    assert_eq!(
        response.results[0].step_names(),
        vec![
            "connect",
            "detect-arch",
            "upload-artifact",
            "extract-install",
            "configure",
            "start-service",
            "health-check"
        ]
    );

    let uploads = harness.connector.uploads(HOST_A);
    assert_eq!(uploads.len(), 3);
    assert_eq!(uploads[0].1, b"amd64 bundle".len());
}

#[tokio::test]
async fn test_agent_rollout_requires_token_secret() {
    let harness = Harness::new(MockConnector::new().with_host(HOST_A, MockHost::new()));
    harness.add_resource("1", HOST_A).await;

    let result = harness
        .app
        .orchestrator
        .deploy_agent(AgentDeployRequest {
            target_resource_ids: vec!["1".to_string()],
        })
        .await;

    assert!(matches!(result, Err(EngineError::ConfigError(_))));
}

#[tokio::test]
async fn test_batch_deadline_stops_remaining_steps() {
    let slow = site_host().on("tar -czf", MockReply::ok("").delayed(Duration::from_millis(300)));
    let harness = Harness::with_options(MockConnector::new().with_host(HOST_A, slow), |options| {
        options.orchestrator.batch_deadline = Duration::from_millis(100);
    });
    harness.add_resource("1", HOST_A).await;
    let artifact_id = upload(&harness).await;

    let response = harness
        .app
        .orchestrator
        .deploy(deploy_request(artifact_id, &["1"], false))
        .await
        .unwrap();

    let result = response.result_for("1").unwrap();
    assert!(!result.success);
    assert_eq!(result.step_names(), vec!["connect", "backup-current", "prune-backups"]);
    assert!(result.steps[2].message.contains("batch deadline"));
}
