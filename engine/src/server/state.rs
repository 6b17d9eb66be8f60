//! Server state

use std::sync::Arc;

use crate::deploy::orchestrator::Orchestrator;
use crate::jobs::JobQueue;
use crate::probe::ProbeEngine;
use crate::relay::Relay;
use crate::ssh::SessionManager;
use crate::storage::store::ResourceStore;

/// Server state shared across handlers
pub struct ServerState {
    pub sessions: Arc<SessionManager>,
    pub store: Arc<dyn ResourceStore>,
    pub probe: Arc<ProbeEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub relay: Arc<Relay>,
    pub jobs: Arc<dyn JobQueue>,
}

impl ServerState {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<dyn ResourceStore>,
        probe: Arc<ProbeEngine>,
        orchestrator: Arc<Orchestrator>,
        relay: Arc<Relay>,
        jobs: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            sessions,
            store,
            probe,
            orchestrator,
            relay,
            jobs,
        }
    }
}
