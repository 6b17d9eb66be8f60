//! Middleware verification against scripted hosts

use secrecy::SecretString;

use opspro_engine::probe::{MiddlewareKind, ServiceState, VerifyRequest};
use opspro_engine::probe::status::collect_status;
use opspro_engine::ssh::mock::{MockConnector, MockHost, MockReply};

use crate::common::Harness;

const HOST: &str = "10.0.0.5";

fn mysql_host(auth: MockReply) -> MockHost {
    MockHost::new()
        .on("echo ok", MockReply::ok("ok\n"))
        .on("/dev/tcp", MockReply::ok("open\n"))
        .on("systemctl is-active", MockReply::ok("active mysqld\n"))
        .on("mysqladmin", auth)
        .on("for p in", MockReply::ok("/var/log/mysqld.log\n"))
        .on("ps -eo args=", MockReply::ok("/usr/sbin/mysqld --basedir=/usr\n-bash\n"))
}

fn request(harness: &Harness, kind: MiddlewareKind, password: Option<&str>) -> VerifyRequest {
    VerifyRequest {
        target: harness.target(HOST),
        kind,
        port: None,
        username: None,
        password: password.map(SecretString::from),
        service_name: None,
    }
}

#[tokio::test]
async fn test_mysql_wrong_password() {
    let denied = MockReply::fail(
        1,
        "mysqladmin: connect to server at '127.0.0.1' failed\nerror: 'Access denied for user 'root'@'localhost' (using password: YES)'",
    );
    let harness = Harness::new(MockConnector::new().with_host(HOST, mysql_host(denied)));

    let report = harness
        .app
        .probe
        .verify(request(&harness, MiddlewareKind::Mysql, Some("wrong")))
        .await
        .unwrap();

    assert!(report.ssh_ok());
    assert!(report.port_reachable());
    assert!(report.service_active());
    assert!(!report.auth_valid());
    assert_eq!(report.auth_message(), Some("access denied"));
    assert!(!report.success());
    assert!(report.message().contains("authentication failed"));
    assert_eq!(report.suggested_log_path(), Some("/var/log/mysqld.log"));
    assert_eq!(report.suggested_service_name(), Some("mysqld"));

    // The password travels in the environment, never as an argument
    let commands = harness.connector.commands(HOST);
    let auth = commands.iter().find(|c| c.contains("mysqladmin")).unwrap();
    assert!(auth.starts_with("MYSQL_PWD='wrong' "));
    assert!(!auth.contains("-pwrong"));

    assert_eq!(harness.connector.open_sessions(), 0);
}

#[tokio::test]
async fn test_mysql_valid_credentials() {
    let valid = MockReply::ok("Uptime: 3600  Threads: 2  Questions: 120  Slow queries: 0  Opens: 12\n");
    let harness = Harness::new(MockConnector::new().with_host(HOST, mysql_host(valid)));

    let report = harness
        .app
        .probe
        .verify(request(&harness, MiddlewareKind::Mysql, Some("secret")))
        .await
        .unwrap();

    assert!(report.auth_valid());
    assert!(report.auth_message().is_none());
    assert!(report.success());
    assert_eq!(report.message(), "verification passed");
}

#[tokio::test]
async fn test_ssh_failure_short_circuits() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, MockHost::unreachable()));

    let report = harness
        .app
        .probe
        .verify(request(&harness, MiddlewareKind::Redis, Some("pw")))
        .await
        .unwrap();

    assert!(!report.ssh_ok());
    assert!(!report.port_reachable());
    assert!(!report.service_active());
    assert!(!report.auth_valid());
    assert!(!report.log_path_found());
    assert!(!report.success());
    assert!(report.message().starts_with("SSH connection failed"));
    assert!(harness.connector.commands(HOST).is_empty());
}

#[tokio::test]
async fn test_rejected_ssh_login_is_reported() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, MockHost::rejecting_auth()));

    let report = harness
        .app
        .probe
        .verify(request(&harness, MiddlewareKind::Mysql, None))
        .await
        .unwrap();

    assert!(!report.ssh_ok());
    assert!(report.message().contains("authentication failed"));
}

#[tokio::test]
async fn test_redis_missing_client_falls_through() {
    let host = MockHost::new()
        .on("echo ok", MockReply::ok("ok\n"))
        .on("/dev/tcp", MockReply::ok("open\n"))
        .on("systemctl is-active", MockReply::ok("active redis-server\n"))
        .on(" redis-cli -h", MockReply::fail(127, "redis-cli: command not found"))
        .on("/usr/bin/redis-cli", MockReply::ok("PONG\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));

    let report = harness
        .app
        .probe
        .verify(request(&harness, MiddlewareKind::Redis, Some("pw")))
        .await
        .unwrap();

    assert!(report.auth_valid());
    assert_eq!(report.raw_details().get("auth_client").map(String::as_str), Some("/usr/bin/redis-cli"));
    assert!(report.success());
}

#[tokio::test]
async fn test_no_password_skips_auth() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, mysql_host(MockReply::ok(""))));

    let report = harness
        .app
        .probe
        .verify(request(&harness, MiddlewareKind::Mysql, None))
        .await
        .unwrap();

    assert!(!report.auth_valid());
    assert!(report.auth_message().is_none());
    assert!(!report.success());
    assert_eq!(report.message(), "authentication not attempted: no credentials supplied");
    assert!(harness.connector.commands(HOST).iter().all(|c| !c.contains("mysqladmin")));
}

#[tokio::test]
async fn test_invalid_service_name_is_rejected() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, mysql_host(MockReply::ok(""))));
    let mut request = request(&harness, MiddlewareKind::Mysql, None);
    request.service_name = Some("mysqld; rm -rf /".to_string());

    assert!(harness.app.probe.verify(request).await.is_err());
    assert_eq!(harness.connector.connect_count(), 0);
}

#[tokio::test]
async fn test_collect_status_inactive_skips_metrics() {
    let host = MockHost::new().on("systemctl is-active", MockReply::ok("inactive\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    let mut request = request(&harness, MiddlewareKind::Redis, Some("pw"));
    request.service_name = Some("redis-server".to_string());

    let status = collect_status(&harness.app.sessions, &request, std::time::Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(status.status, ServiceState::Inactive);
    assert!(status.metrics.is_empty());
    assert_eq!(harness.connector.open_sessions(), 0);
}
