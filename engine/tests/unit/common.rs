//! Shared fixtures: an engine wired to a scripted SSH connector

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tempfile::TempDir;

use opspro_engine::app::options::AppOptions;
use opspro_engine::app::state::AppState;
use opspro_engine::server::serve::router;
use opspro_engine::ssh::mock::{MockConnector, MockHost, MockReply};
use opspro_engine::ssh::Target;
use opspro_engine::storage::layout::StorageLayout;
use opspro_engine::storage::settings::Settings;
use opspro_engine::storage::store::{MemoryStore, Resource};
use opspro_engine::utils::CooldownOptions;
use opspro_engine::vault::{CredentialVault, SshSecret};

pub struct Harness {
    pub connector: Arc<MockConnector>,
    pub store: Arc<MemoryStore>,
    pub vault: Arc<CredentialVault>,
    pub options: AppOptions,
    pub app: AppState,
    _dir: TempDir,
}

impl Harness {
    pub fn new(connector: MockConnector) -> Self {
        Self::with_options(connector, |_| {})
    }

    pub fn with_options(connector: MockConnector, tweak: impl FnOnce(&mut AppOptions)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut options = AppOptions::from_settings(&Settings::default(), StorageLayout::new(dir.path()));
        options.probe.reachability_retry = CooldownOptions {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            multiplier: 1.0,
        };
        options.relay.poll_interval = Duration::from_millis(20);
        tweak(&mut options);

        let connector = Arc::new(connector);
        let vault = Arc::new(CredentialVault::from_master_secret("test").unwrap());
        let store = Arc::new(MemoryStore::new());
        let app = AppState::with_parts(&options, connector.clone(), vault.clone(), store.clone());

        Self {
            connector,
            store,
            vault,
            options,
            app,
            _dir: dir,
        }
    }

    /// Register a root-login resource on `host`
    pub async fn add_resource(&self, id: &str, host: &str) -> Resource {
        let resource = Resource {
            id: id.to_string(),
            name: Some(format!("web-{}", id)),
            host_address: host.to_string(),
            ssh_port: 22,
            ssh_username: "root".to_string(),
            credential_handle: self.vault.store(&SshSecret::password("pw")).unwrap(),
        };
        self.store.insert_resource(resource.clone()).await;
        resource
    }

    pub fn target(&self, host: &str) -> Target {
        Target::new(host, 22, "root", self.vault.store(&SshSecret::password("pw")).unwrap())
    }

    pub fn router(&self) -> Router {
        router(Arc::new(self.app.server_state()), self.options.server.max_upload_bytes)
    }
}

/// A host where every site step succeeds
pub fn site_host() -> MockHost {
    MockHost::new().on("docker inspect", MockReply::ok("true\n"))
}

/// Zip archive holding a minimal site
pub fn site_zip() -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("index.html", options).unwrap();
        writer.write_all(b"<h1>hello</h1>").unwrap();
        writer.start_file("assets/app.css", options).unwrap();
        writer.write_all(b"body {}").unwrap();
        writer.finish().unwrap();
    }
    buf.into_inner()
}
