//! Bounded retry with a forced reconnect in between.
//!
//! Every directory operation runs through [`run`]: at most two physical
//! attempts, the second one only after a transient connection failure and a
//! fresh bind.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::directory::Directory;
use crate::error::{DirectoryError, Failure, Result};
use crate::session::Session;


pub const MAX_ATTEMPTS: u32 = 2;


/// One logical directory operation.
#[async_trait]
pub trait Operation: Send {
    type Output: Send;

    /// Short name for logging, e.g. `"delete"`.
    fn name(&self) -> &'static str;

    /// The DN the operation is about, for logging.
    fn target(&self) -> &str;

    /// Performs one physical attempt on a bound connection.
    async fn attempt(&mut self, connection: &mut dyn Directory) -> std::result::Result<Self::Output, Failure>;

    /// Turns a non-transient failure into the caller-facing error.
    fn reject(&self, failure: Failure) -> DirectoryError;
}


pub async fn run<O: Operation>(session: &mut Session, operation: &mut O) -> Result<O::Output> {
    if !session.is_bound() {
        session.connect().await?;
    }

    let mut attempt = 1;
    loop {
        let Some(connection) = session.connection_mut() else {
            return Err(DirectoryError::Connect("no bound connection".to_owned()));
        };

        let failure = match operation.attempt(connection).await {
            Ok(output) => {
                debug!(operation = operation.name(), dn = operation.target(), attempt, "directory operation succeeded");
                return Ok(output);
            },
            Err(failure) => failure,
        };

        if !failure.is_transient() {
            debug!(operation = operation.name(), dn = operation.target(), error = %failure, "directory operation rejected");
            return Err(operation.reject(failure));
        }

        if attempt >= MAX_ATTEMPTS {
            warn!(
                operation = operation.name(), dn = operation.target(), error = %failure,
                "directory operation failed again after reconnecting; giving up"
            );
            // the connection is presumably dead; make the next call start over
            session.disconnect().await;
            return Err(DirectoryError::TransientNetwork(failure.message));
        }

        warn!(
            operation = operation.name(), dn = operation.target(), error = %failure,
            "transient directory failure; reconnecting and retrying once"
        );
        session.reconnect().await?;
        attempt += 1;
    }
}
