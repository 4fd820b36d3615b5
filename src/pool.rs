use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::RarityError;

/// Builds the shared connection pool (for HTTP, a keep-alive client).
pub trait Connector: Send + Sync {
    type Connection: Send + Sync;

    fn connect(&self) -> Result<Self::Connection, RarityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    Healthy,
    /// A connection-reset failure was seen; the pool must not be reused.
    Poisoned,
    /// A replacement pool is being built.
    Rebuilding,
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolHealth::Healthy => write!(f, "healthy"),
            PoolHealth::Poisoned => write!(f, "poisoned"),
            PoolHealth::Rebuilding => write!(f, "rebuilding"),
        }
    }
}

/// Checked-out connection tagged with the pool generation it came from.
pub struct Lease<T> {
    pub connection: Arc<T>,
    pub generation: u64,
}

struct PoolState<T> {
    connection: Option<Arc<T>>,
    health: PoolHealth,
    generation: u64,
    rebuilds: u64,
}

/// One shared pool, replaced wholesale when it is presumed poisoned.
///
/// Transitions: `Healthy --reset--> Poisoned --> Rebuilding --> Healthy`. A
/// rebuild that fails leaves the pool `Poisoned`; the next checkout retries it.
/// Callers still holding a lease on the old generation finish their attempt on
/// it; the old pool is dropped when the last lease goes away.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    state: Mutex<PoolState<C::Connection>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C) -> Result<Self, RarityError> {
        let connection = connector.connect()?;
        Ok(Self {
            connector,
            state: Mutex::new(PoolState {
                connection: Some(Arc::new(connection)),
                health: PoolHealth::Healthy,
                generation: 0,
                rebuilds: 0,
            }),
        })
    }

    pub fn checkout(&self) -> Result<Lease<C::Connection>, RarityError> {
        let mut state = self.lock();
        if state.health != PoolHealth::Healthy {
            self.rebuild(&mut state)?;
        }
        let connection = state
            .connection
            .clone()
            .ok_or_else(|| RarityError::HttpClient("connection pool is empty".to_string()))?;
        Ok(Lease {
            connection,
            generation: state.generation,
        })
    }

    /// Reports a connection reset seen on `generation` and rebuilds the pool
    /// before returning. A report against an already replaced generation is
    /// ignored.
    pub fn report_reset(&self, generation: u64) -> Result<(), RarityError> {
        let mut state = self.lock();
        if state.generation != generation {
            return Ok(());
        }
        state.health = PoolHealth::Poisoned;
        tracing::warn!(generation, "connection reset; discarding pool");
        self.rebuild(&mut state)
    }

    pub fn health(&self) -> PoolHealth {
        self.lock().health
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn rebuilds(&self) -> u64 {
        self.lock().rebuilds
    }

    /// Drops the pool at the end of a run. Outstanding leases keep their
    /// connection alive until they finish.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.connection = None;
        state.health = PoolHealth::Poisoned;
    }

    fn rebuild(&self, state: &mut PoolState<C::Connection>) -> Result<(), RarityError> {
        state.health = PoolHealth::Rebuilding;
        state.connection = None;
        match self.connector.connect() {
            Ok(connection) => {
                state.connection = Some(Arc::new(connection));
                state.generation += 1;
                state.rebuilds += 1;
                state.health = PoolHealth::Healthy;
                tracing::debug!(generation = state.generation, "connection pool rebuilt");
                Ok(())
            }
            Err(err) => {
                state.health = PoolHealth::Poisoned;
                Err(err)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
