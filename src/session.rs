//! The single physical connection to the directory and its state.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::directory::{Connector, Directory};
use crate::error::{DirectoryError, Result};


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Bound,
    Failed,
}


/// Owns at most one bound connection.
///
/// A session is not safe for concurrent protocol calls; callers serialize
/// access to it (see `DirectoryClient`).
pub struct Session {
    connector: Arc<dyn Connector>,
    connection: Option<Box<dyn Directory>>,
    state: SessionState,
    reconnects: u64,
}
impl Session {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connection: None,
            state: SessionState::Disconnected,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state == SessionState::Bound && self.connection.is_some()
    }

    /// How many times the connection was torn down and rebuilt.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    /// Opens a new connection and binds. On failure the session is `Failed`.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            self.disconnect().await;
        }

        let address = self.connector.address();
        self.state = SessionState::Connecting;
        debug!(address = %address, "connecting to directory");

        match self.connector.connect().await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = SessionState::Bound;
                info!(address = %address, "directory connection bound");
                Ok(())
            },
            Err(failure) => {
                self.state = SessionState::Failed;
                warn!(address = %address, error = %failure, "directory connection failed");
                Err(DirectoryError::Connect(failure.message))
            },
        }
    }

    /// Unbinds and drops the connection. Errors are only logged; the session
    /// is `Disconnected` afterwards regardless.
    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(failure) = connection.unbind().await {
                debug!(error = %failure, "ignoring error while unbinding");
            }
        }
        self.state = SessionState::Disconnected;
    }

    /// Disconnect followed by connect.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.reconnects += 1;
        info!(reconnects = self.reconnects, "reconnecting to directory");
        self.disconnect().await;
        self.connect().await
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut (dyn Directory + 'static)> {
        if self.state != SessionState::Bound {
            return None;
        }
        self.connection.as_deref_mut()
    }
}
