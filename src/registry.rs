use crate::broker::Broker;
use crate::config::Settings;
use crate::ports::PortPool;
use crate::preview::ServerTable;
use crate::session::SessionTable;

/// The process-wide state store: server states, terminal sessions, the port
/// pool, and the event broker.
///
/// Cloning is cheap and every clone refers to the same state; each test
/// builds its own instead of sharing a global.
#[derive(Clone)]
pub struct Registry {
    pub servers: ServerTable,
    pub sessions: SessionTable,
    pub ports: PortPool,
    pub events: Broker,
}

impl Registry {
    pub fn new(settings: &Settings) -> Self {
        Self::with_port_pool(PortPool::new(
            settings.port_range_start,
            settings.port_range_end,
        ))
    }

    pub fn with_port_pool(ports: PortPool) -> Self {
        Self {
            servers: ServerTable::new(),
            sessions: SessionTable::new(),
            ports,
            events: Broker::new(),
        }
    }
}
