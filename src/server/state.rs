use axum::extract::FromRef;

use crate::daemon::Daemon;
use std::sync::Arc;

pub type GuardedDaemon = Arc<Daemon>;

#[derive(Clone)]
pub struct ServerState {
    pub daemon: GuardedDaemon,
}

impl ServerState {
    pub fn new(daemon: GuardedDaemon) -> Self {
        Self { daemon }
    }
}

impl FromRef<ServerState> for GuardedDaemon {
    fn from_ref(input: &ServerState) -> Self {
        input.daemon.clone()
    }
}
