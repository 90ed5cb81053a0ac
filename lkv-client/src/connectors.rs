//! # Connectors
//!
//! Purpose: Own one `Pool` per node plus the `HashRing`, and hand callers a
//! `Handle` on the connection that owns their routing key.
//!
//! ## Design Principles
//! 1. **Ring Subset of Pools**: A node enters the ring only after its pool
//!    is registered and leaves the ring before its pool is stopped, so a
//!    routed id always has a pool behind it.
//! 2. **No Blocking Under Locks**: Routing and pool lookup take short read
//!    locks; the checkout itself runs after both are released.
//! 3. **Serialized Membership**: `start`, `close`, `add_node` and
//!    `remove_node` run one at a time under the lifecycle lock, so a pool is
//!    never registered into a registry that closed or started meanwhile.
//! 4. **Pass-through Errors**: Pool backpressure and connect failures reach
//!    the caller unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use lkv_common::{ConnectorsConfig, LkvError, LkvResult, NodeConfig, Value};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::Reply;
use crate::pool::{Pool, PoolStats, PoolStatus, PooledConnection};
use crate::router::HashRing;

/// Registry of node pools behind a consistent-hash router.
///
/// Lifecycle: `new` → `start` → `close`. Dropping the registry closes it.
pub struct Connectors {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    router: RwLock<HashRing>,
    status: Mutex<PoolStatus>,
    // Held across every status change and membership change.
    lifecycle: Mutex<()>,
}

impl Connectors {
    /// Validates `config` and builds one unstarted pool per node.
    pub fn new(config: ConnectorsConfig) -> LkvResult<Self> {
        config.validate()?;

        let mut pools = HashMap::with_capacity(config.nodes.len());
        let mut router = HashRing::new();
        for node in config.nodes {
            let weight = node.weight;
            let pool = Pool::new(node)?;
            router.add_node(pool.node_id(), weight)?;
            pools.insert(pool.node_id().to_string(), Arc::new(pool));
        }

        Ok(Connectors {
            pools: RwLock::new(pools),
            router: RwLock::new(router),
            status: Mutex::new(PoolStatus::Uninitialized),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.lock()
    }

    /// Starts every pool.
    ///
    /// When one pool fails, the pools already started are stopped and
    /// replaced with fresh ones, so the registry stays `Uninitialized` and
    /// `start` may be called again.
    pub fn start(&self) -> LkvResult<()> {
        let _lifecycle = self.lifecycle.lock();
        let status = self.status();
        if status != PoolStatus::Uninitialized {
            return Err(LkvError::Config(format!(
                "connectors cannot start from {status:?}"
            )));
        }

        let mut pools = self.pools.write();
        let ids: Vec<String> = pools.keys().cloned().collect();
        for (done, id) in ids.iter().enumerate() {
            let result = match pools.get(id) {
                Some(pool) => pool.start(),
                None => Ok(()),
            };
            if let Err(err) = result {
                warn!(node = %id, error = %err, "node failed to start, rolling back");
                for id in &ids[..done] {
                    if let Some(pool) = pools.get_mut(id) {
                        pool.stop();
                        let fresh = Pool::new(pool.config().clone())?;
                        *pool = Arc::new(fresh);
                    }
                }
                return Err(err);
            }
        }

        *self.status.lock() = PoolStatus::Running;
        info!(nodes = pools.len(), "connectors started");
        Ok(())
    }

    /// Checks out a connection for the node owning `routing_args`.
    ///
    /// The routing key is the concatenated byte form of the arguments.
    pub fn get_client(&self, routing_args: &[Value]) -> LkvResult<Handle> {
        let key = routing_key(routing_args)?;
        self.get_client_by_key(&key)
    }

    /// Checks out a connection for the node owning `key`.
    pub fn get_client_by_key(&self, key: &[u8]) -> LkvResult<Handle> {
        self.ensure_running()?;
        let pool = {
            let router = self.router.read();
            let node = router
                .route(key)
                .ok_or_else(|| LkvError::Config("no nodes routed".to_string()))?;
            match self.pools.read().get(node) {
                Some(pool) => Arc::clone(pool),
                None => return Err(LkvError::NotRunning("node removed")),
            }
        };

        let conn = pool.checkout()?;
        Ok(Handle { conn })
    }

    /// Adds a node at runtime. Its pool is started before it is routed to.
    ///
    /// Before `start` the pool is only registered; `start` starts it with
    /// the others. Fails with `NotRunning` once the registry is closed.
    pub fn add_node(&self, config: NodeConfig) -> LkvResult<()> {
        let _lifecycle = self.lifecycle.lock();
        let id = config.id();
        let weight = config.weight;
        if self.pools.read().contains_key(&id) {
            return Err(LkvError::Config(format!("duplicate node {id}")));
        }

        let pool = Arc::new(Pool::new(config)?);
        match self.status() {
            PoolStatus::Running => pool.start()?,
            PoolStatus::Uninitialized => {}
            PoolStatus::Stopped => return Err(LkvError::NotRunning("connectors closed")),
        }

        self.pools.write().insert(id.clone(), pool);
        if let Err(err) = self.router.write().add_node(id.clone(), weight) {
            if let Some(pool) = self.pools.write().remove(&id) {
                pool.stop();
            }
            return Err(err);
        }

        info!(node = %id, weight, "node added");
        Ok(())
    }

    /// Removes a node: it stops receiving new keys, then its pool is stopped.
    /// Handles already checked out stay usable and close at checkin.
    ///
    /// Returns false when the node is unknown.
    pub fn remove_node(&self, id: &str) -> bool {
        let _lifecycle = self.lifecycle.lock();
        let routed = self.router.write().remove_node(id);
        let pool = self.pools.write().remove(id);
        match pool {
            Some(pool) => {
                pool.stop();
                info!(node = %id, "node removed");
                true
            }
            None => routed,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.router.read().contains(id)
    }

    /// Routed node ids in registration order.
    pub fn node_ids(&self) -> Vec<String> {
        self.router.read().node_ids().map(str::to_string).collect()
    }

    /// Per-node pool counters.
    pub fn stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .read()
            .iter()
            .map(|(id, pool)| (id.clone(), pool.stats()))
            .collect()
    }

    /// Stops every pool. Idempotent.
    pub fn close(&self) {
        let _lifecycle = self.lifecycle.lock();
        {
            let mut status = self.status.lock();
            if *status == PoolStatus::Stopped {
                return;
            }
            *status = PoolStatus::Stopped;
        }

        let pools: Vec<Arc<Pool>> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in &pools {
            pool.stop();
        }
        info!(nodes = pools.len(), "connectors closed");
    }

    fn ensure_running(&self) -> LkvResult<()> {
        match self.status() {
            PoolStatus::Running => Ok(()),
            PoolStatus::Uninitialized => Err(LkvError::NotRunning("connectors not started")),
            PoolStatus::Stopped => Err(LkvError::NotRunning("connectors closed")),
        }
    }
}

impl Drop for Connectors {
    fn drop(&mut self) {
        self.close();
    }
}

/// Concatenated byte form of `args`.
fn routing_key(args: &[Value]) -> LkvResult<Vec<u8>> {
    let mut key = Vec::new();
    for arg in args {
        // Routing never leaves the process, so JSON values always hash.
        key.extend_from_slice(&arg.to_bytes(true)?);
    }
    Ok(key)
}

/// Caller-facing connection; dropping it checks the connection back in.
pub struct Handle {
    conn: PooledConnection,
}

impl Handle {
    /// Node this handle is bound to.
    pub fn node_id(&self) -> &str {
        self.conn.node_id()
    }

    /// Runs `command` with `args` and checks the reply status.
    ///
    /// `ok` and `not_found` replies are returned; any other status becomes
    /// `LkvError::Server`.
    pub fn execute(&mut self, command: &str, args: &[Value]) -> LkvResult<Reply> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::from(command));
        full.extend_from_slice(args);
        debug!(node = %self.conn.node_id(), command, "execute");
        self.conn.execute(&full)?.check()
    }

    /// Returns the connection to its pool.
    pub fn close(self) {
        self.conn.close();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("node", &self.conn.node_id())
            .field("slot", &self.conn.slot())
            .finish()
    }
}
