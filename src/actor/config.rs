use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Id, RouteTableConfig};
use crate::core::lookup::LookupConfig;
use crate::core::routing_maintenance::MaintenanceConfig;
use crate::core::server::{DefaultFilter, RequestFilter, MAX_VALUE_SIZE};
use crate::core::store::StoreConfig;
use crate::core::timeout::{FixedTimeout, TimeoutStrategy};
use crate::core::value_store::{ValueStore, DEFAULT_VALUE_TTL, MAX_VALUES};

/// Default deadline of a user operation, after which it fails with
/// [OperationError::DeadlineExceeded](crate::OperationError::DeadlineExceeded).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes
    ///
    /// Defaults to no bootstrap nodes, making this node the first of a new network.
    pub bootstrap: Vec<SocketAddr>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, trying [DEFAULT_PORT](super::socket::DEFAULT_PORT) first, then
    /// any free port.
    pub port: Option<u16>,
    /// Address to bind the socket to.
    ///
    /// Defaults to `0.0.0.0`
    pub bind_address: Option<IpAddr>,
    /// This node's id.
    ///
    /// Defaults to a random id.
    pub id: Option<Id>,
    /// Routing table settings.
    pub routing: RouteTableConfig,
    /// Iterative lookups settings.
    pub lookup: LookupConfig,
    /// Store replication settings.
    pub store: StoreConfig,
    /// Maintenance schedule.
    pub maintenance: MaintenanceConfig,
    /// Decides how long to wait for each response.
    ///
    /// Defaults to [FixedTimeout] of [DEFAULT_REQUEST_TIMEOUT](crate::DEFAULT_REQUEST_TIMEOUT)
    pub request_timeout: Arc<dyn TimeoutStrategy>,
    /// Deadline of user operations.
    ///
    /// Defaults to [DEFAULT_OPERATION_TIMEOUT]
    pub operation_timeout: Duration,
    /// Largest value accepted in a STORE request.
    ///
    /// Defaults to [MAX_VALUE_SIZE]
    pub max_value_size: usize,
    /// Capacity of the default value store.
    ///
    /// Defaults to [MAX_VALUES]
    pub max_values: usize,
    /// Time to live of values in the default value store.
    ///
    /// Defaults to [DEFAULT_VALUE_TTL]
    pub value_ttl: Duration,
    /// Custom value store replacing the default in-memory one.
    ///
    /// Defaults to None
    pub value_store: Option<Arc<dyn ValueStore>>,
    /// Filter requests before handling them.
    ///
    /// Defaults to a filter that allows everything.
    pub filter: Arc<dyn RequestFilter>,
    /// Forward stored values to newly seen contacts that are closer to their keys.
    ///
    /// Defaults to `true`
    pub store_forward: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            port: None,
            bind_address: None,
            id: None,
            routing: RouteTableConfig::default(),
            lookup: LookupConfig::default(),
            store: StoreConfig::default(),
            maintenance: MaintenanceConfig::default(),
            request_timeout: Arc::new(FixedTimeout::default()),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_value_size: MAX_VALUE_SIZE,
            max_values: MAX_VALUES,
            value_ttl: DEFAULT_VALUE_TTL,
            value_store: None,
            filter: Arc::new(DefaultFilter),
            store_forward: true,
        }
    }
}
