//! Replica-aware connection establishment for the Postgres backend.
//!
//! Grounded on the teacher's `ClientSource`/`WithClient` pair (`eugene/src/lib.rs`),
//! which separates "how to get hold of a `postgres::Client`" from "what to do with one".
//! Generalized here to a set of equally-valid replica DSNs with failover, per SPEC_FULL
//! §9's re-architecture note: the original system advances through replicas by mutating
//! a connection manager's DSN field in place; `ReplicaSet::next` instead returns a new,
//! independent value, so a caller can hold the replica it is currently bound to without
//! it shifting out from under a concurrent borrower.

use std::time::Duration;

use postgres::{Client, NoTls};
use rand::Rng;

use crate::error::ErrorKind;

/// An ordered list of equally-valid DSNs for the same logical database (a primary plus
/// its read replicas, or a set of replicas behind a failover proxy), with a cursor
/// pointing at the one currently in use.
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    dsns: Vec<String>,
    current: usize,
}

impl ReplicaSet {
    /// # Panics
    /// Panics if `dsns` is empty; a replica set with no members cannot be connected to.
    pub fn new(dsns: Vec<String>) -> Self {
        assert!(!dsns.is_empty(), "ReplicaSet needs at least one DSN");
        ReplicaSet { dsns, current: 0 }
    }

    pub fn single(dsn: impl Into<String>) -> Self {
        ReplicaSet::new(vec![dsn.into()])
    }

    pub fn current_dsn(&self) -> &str {
        &self.dsns[self.current]
    }

    pub fn len(&self) -> usize {
        self.dsns.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// The replica set that results from this one, having given up on the current DSN
    /// and moved on to the next (wrapping back to the first once every DSN has been
    /// tried). Does not mutate `self`.
    pub fn next(&self) -> ReplicaSet {
        ReplicaSet {
            dsns: self.dsns.clone(),
            current: (self.current + 1) % self.dsns.len(),
        }
    }

    fn connect_current(&self) -> crate::Result<Client> {
        Ok(Client::connect(self.current_dsn(), NoTls)?)
    }
}

/// Opens connections against a [`ReplicaSet`], advancing through replicas on a
/// disconnect and backing off with jitter before each retry, rather than hammering a
/// replica that just dropped the connection.
pub struct PostgresConnectionFactory {
    replicas: ReplicaSet,
    max_attempts: usize,
    backoff: Duration,
}

impl PostgresConnectionFactory {
    pub fn new(replicas: ReplicaSet) -> Self {
        let max_attempts = replicas.len();
        PostgresConnectionFactory {
            replicas,
            max_attempts,
            backoff: Duration::from_millis(50),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    /// Connect to the current replica; on a connection-broken error, advance to the
    /// next replica and retry, up to one attempt per configured replica.
    pub fn connect(&mut self) -> crate::Result<Client> {
        let mut last_err = None;
        for attempt in 0..self.max_attempts.max(1) {
            if attempt > 0 {
                let jitter = rand::rng().random_range(0..self.backoff.as_millis() as u64 + 1);
                std::thread::sleep(self.backoff + Duration::from_millis(jitter));
                self.replicas = self.replicas.next();
                log::warn!(
                    "retrying connection against replica {}/{}",
                    attempt + 1,
                    self.max_attempts
                );
            }
            match self.replicas.connect_current() {
                Ok(client) => return Ok(client),
                Err(e) if matches!(e.kind, ErrorKind::Disconnected) => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ErrorKind::Disconnected.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_wraps_without_mutating_original() {
        let a = ReplicaSet::new(vec!["a".into(), "b".into(), "c".into()]);
        let b = a.next();
        let c = b.next();
        let wrapped = c.next();
        assert_eq!(a.current_dsn(), "a");
        assert_eq!(b.current_dsn(), "b");
        assert_eq!(c.current_dsn(), "c");
        assert_eq!(wrapped.current_dsn(), "a");
    }

    #[test]
    fn single_replica_set_wraps_to_itself() {
        let a = ReplicaSet::single("only");
        assert_eq!(a.next().current_dsn(), "only");
    }
}
