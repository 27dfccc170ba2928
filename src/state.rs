use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Mutex, RwLock};

use crate::config::AgentConfig;
use crate::console::{ConsoleRing, CONSOLE_BUFFER_SIZE};
use crate::model::{ServerInstance, ServerStatus};
use crate::protocol::{AgentEvent, ConsoleLine};
use crate::provider::ProviderRegistry;
use crate::sampler::ResourceSampler;
use crate::supervisor::ProcessSupervisor;

/// Id the agent gives its single managed server.
pub const AGENT_SERVER_ID: &str = "server";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub token: Arc<str>,
    pub supervisor: ProcessSupervisor,
    pub sampler: ResourceSampler,
    pub providers: Arc<ProviderRegistry>,
    pub current: Arc<RwLock<Option<ServerInstance>>>,
    pub console: Arc<Mutex<ConsoleRing<ConsoleLine>>>,
    pub events: broadcast::Sender<AgentEvent>,
    pub started: Instant,
}

impl AppState {
    pub fn new(
        config: AgentConfig,
        token: String,
        supervisor: ProcessSupervisor,
        sampler: ResourceSampler,
        current: Option<ServerInstance>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config: Arc::new(config),
            token: token.into(),
            supervisor,
            sampler,
            providers: Arc::new(ProviderRegistry::with_defaults()),
            current: Arc::new(RwLock::new(current)),
            console: Arc::new(Mutex::new(ConsoleRing::new(CONSOLE_BUFFER_SIZE))),
            events,
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Status of the managed server; `stopped` when nothing is running or
    /// nothing has been set up.
    pub fn server_status(&self) -> (ServerStatus, Option<u32>) {
        match self.supervisor.get_status(AGENT_SERVER_ID) {
            Some(p) => (p.status, p.pid),
            None => (ServerStatus::Stopped, None),
        }
    }

    pub fn status_event(&self) -> AgentEvent {
        let (server_status, pid) = self.server_status();
        AgentEvent::Status {
            server_status,
            pid,
            players: self.sampler.players(AGENT_SERVER_ID),
        }
    }

    pub fn broadcast(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}
