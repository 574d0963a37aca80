//! Statistics sink contract

use std::sync::Arc;

use crate::session::TransportSession;

/// Receives the session live statistics should be collected from
pub trait StatsSink: Send + Sync {
    fn start_remote_stats(&self, session: Arc<dyn TransportSession>);

    fn stop_remote_stats(&self);
}

/// Sink that ignores everything, for deployments without statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn start_remote_stats(&self, _session: Arc<dyn TransportSession>) {}

    fn stop_remote_stats(&self) {}
}
