//! Live stream attach, delivery and teardown

use std::time::Duration;

use futures::future::join_all;

use opspro_engine::errors::EngineError;
use opspro_engine::relay::{Delivery, LogSource, RelayHandle};
use opspro_engine::ssh::mock::{MockConnector, MockHost, MockReply};

use crate::common::Harness;

const HOST: &str = "10.0.2.1";

fn app_log() -> LogSource {
    LogSource::File {
        path: "/var/log/app.log".to_string(),
    }
}

fn tailing_host(lines: &[&str], hold_open: bool) -> MockHost {
    MockHost::new().stream("tail -n 100 -F '/var/log/app.log'", lines, hold_open)
}

/// Read deliveries until `count` lines arrived
async fn read_lines(handle: &mut RelayHandle, count: usize) -> Vec<String> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.len() < count {
            match handle.next().await {
                Some(Delivery::Lines { lines, .. }) => seen.extend(lines),
                other => panic!("unexpected delivery {:?}", other),
            }
        }
    })
    .await
    .unwrap();
    seen
}

/// Read deliveries until the close notice
async fn read_until_closed(handle: &mut RelayHandle) -> (Vec<String>, String) {
    let mut seen = Vec::new();
    let notice = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match handle.next().await {
                Some(Delivery::Lines { lines, .. }) => seen.extend(lines),
                Some(Delivery::Closed(notice)) => return notice,
                None => panic!("finished without a close notice"),
            }
        }
    })
    .await
    .unwrap();
    (seen, notice)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_stream_delivers_lines_in_order() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, tailing_host(&["one", "two", "three"], true)));
    let target = harness.target(HOST);

    let mut handle = harness.app.relay.open("7", &target, app_log()).await.unwrap();
    assert_eq!(read_lines(&mut handle, 3).await, vec!["one", "two", "three"]);

    handle.close().await;
}

#[tokio::test]
async fn test_close_releases_remote_side() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, tailing_host(&["line"], true)));
    let target = harness.target(HOST);

    let mut handle = harness.app.relay.open("7", &target, app_log()).await.unwrap();
    read_lines(&mut handle, 1).await;
    assert_eq!(harness.connector.open_streams(), 1);
    assert_eq!(harness.connector.open_sessions(), 1);

    handle.close().await;
    assert_eq!(harness.connector.open_streams(), 0);
    assert_eq!(harness.connector.open_sessions(), 0);
    assert_eq!(harness.app.relay.registry().active_count(), 0);

    // The same stream can be attached again right away
    let mut again = harness.app.relay.open("7", &target, app_log()).await.unwrap();
    read_lines(&mut again, 1).await;
    again.close().await;
    assert_eq!(harness.connector.connect_count(), 2);
}

#[tokio::test]
async fn test_second_reader_is_refused() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, tailing_host(&[], true)));
    let target = harness.target(HOST);

    let first = harness.app.relay.open("7", &target, app_log()).await.unwrap();
    let second = harness.app.relay.open("7", &target, app_log()).await;
    assert!(matches!(second, Err(EngineError::AlreadyAttached(_))));
    // refused before any connection was made
    assert_eq!(harness.connector.connect_count(), 1);

    // Another resource may read the same path
    let other = harness.app.relay.open("8", &target, app_log()).await.unwrap();

    first.close().await;
    other.close().await;
    assert_eq!(harness.connector.open_sessions(), 0);
}

#[tokio::test]
async fn test_remote_exit_sends_close_notice() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, MockHost::new()));
    let target = harness.target(HOST);
    let source = LogSource::Command {
        command: "journalctl -u nginx -f".to_string(),
    };

    let mut handle = harness.app.relay.open("7", &target, source).await.unwrap();
    let (lines, notice) = read_until_closed(&mut handle).await;
    assert!(lines.is_empty());
    assert_eq!(notice, "stream closed by remote host (exit 0)");
    assert!(handle.next().await.is_none());

    handle.close().await;
    assert_eq!(harness.connector.open_streams(), 0);
    assert_eq!(harness.connector.open_sessions(), 0);
    assert_eq!(harness.app.relay.registry().active_count(), 0);
}

#[tokio::test]
async fn test_finished_stream_flushes_then_closes() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, tailing_host(&["a", "b"], false)));
    let target = harness.target(HOST);

    let mut handle = harness.app.relay.open("7", &target, app_log()).await.unwrap();
    let (lines, notice) = read_until_closed(&mut handle).await;
    assert_eq!(lines, vec!["a", "b"]);
    assert_eq!(notice, "stream closed by remote host");
    handle.close().await;
}

#[tokio::test]
async fn test_missing_log_file_is_reported_as_a_line() {
    let host = MockHost::new().on("log file not found", MockReply::ok("log file not found: /var/log/app.log\n"));
    let harness = Harness::new(MockConnector::new().with_host(HOST, host));
    let target = harness.target(HOST);

    let mut handle = harness.app.relay.open("7", &target, app_log()).await.unwrap();
    let (lines, _) = read_until_closed(&mut handle).await;
    assert_eq!(lines, vec!["log file not found: /var/log/app.log"]);
    handle.close().await;
}

#[tokio::test]
async fn test_dropping_handle_detaches() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, tailing_host(&["x"], true)));
    let target = harness.target(HOST);

    let mut handle = harness.app.relay.open("7", &target, app_log()).await.unwrap();
    read_lines(&mut handle, 1).await;
    drop(handle);

    let connector = harness.connector.clone();
    wait_for(|| connector.open_streams() == 0 && connector.open_sessions() == 0).await;
    let relay = harness.app.relay.clone();
    wait_for(|| relay.registry().active_count() == 0).await;
}

#[tokio::test]
async fn test_invalid_source_is_rejected() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, MockHost::new()));
    let target = harness.target(HOST);

    let relative = LogSource::File {
        path: "var/log/app.log".to_string(),
    };
    assert!(matches!(
        harness.app.relay.open("7", &target, relative).await,
        Err(EngineError::ValidationError(_))
    ));

    let container = LogSource::Container {
        container: "web; reboot".to_string(),
    };
    assert!(harness.app.relay.open("7", &target, container).await.is_err());
    assert_eq!(harness.connector.connect_count(), 0);
}

#[tokio::test]
async fn test_unreachable_host_leaves_nothing_registered() {
    let harness = Harness::new(MockConnector::new().with_host(HOST, MockHost::unreachable()));
    let target = harness.target(HOST);

    let result = harness.app.relay.open("7", &target, app_log()).await;
    assert!(matches!(result, Err(EngineError::ConnectionError(_))));
    assert_eq!(harness.app.relay.registry().active_count(), 0);
}

#[tokio::test]
async fn test_session_cap_bounds_concurrency() {
    let host = MockHost::new().on("sleep", MockReply::ok("done").delayed(Duration::from_millis(50)));
    let harness = Harness::with_options(MockConnector::new().with_host(HOST, host), |options| {
        options.ssh.per_host_cap = 2;
    });
    let target = harness.target(HOST);

    let results = join_all((0..6).map(|_| {
        harness
            .app
            .sessions
            .execute(&target, "sleep 1", Duration::from_secs(5))
    }))
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(harness.connector.connect_count(), 6);
    assert!(harness.connector.peak_sessions() <= 2);
    assert_eq!(harness.connector.open_sessions(), 0);
    assert_eq!(harness.app.sessions.available_slots(&target), 2);
}
