#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod actor;
mod common;
mod core;
mod dht;
mod error;

#[cfg(feature = "async")]
pub mod async_dht;

pub use crate::actor::config::{Config, DEFAULT_OPERATION_TIMEOUT};
pub use crate::actor::socket::{Transport, UdpTransport, DEFAULT_PORT};
pub use crate::actor::{Actor, BootstrapOutcome, Info, OperationError};
pub use crate::common::{
    AddOutcome, Contact, ContactKind, Id, RouteTable, RouteTableConfig, RouteTableEvent,
    ID_SIZE, MAX_BUCKET_SIZE_K,
};
pub use crate::core::lookup::{LookupConfig, LookupOutcome, ValueOutcome};
pub use crate::core::routing_maintenance::MaintenanceConfig;
pub use crate::core::server::{DefaultFilter, RequestFilter, MAX_VALUE_SIZE};
pub use crate::core::store::{PutOutcome, StoreConfig, StoreError, StoreOutcome};
pub use crate::core::timeout::{FixedTimeout, RttTimeout, TimeoutStrategy, DEFAULT_REQUEST_TIMEOUT};
pub use crate::core::value_store::{MemoryValueStore, ValueStore};
pub use crate::core::OperationId;
pub use dht::{Dht, DhtBuilder, DhtWasShutdown, OperationHandle, Testnet};
pub use error::{Error, Result};

/// Wire messages, for custom [Transport]s and [RequestFilter]s.
pub mod messages {
    pub use crate::common::messages::{
        ErrorSpecific, FindNodeRequestArguments, FindValueRequestArguments, Message, MessageId,
        MessageType, NodesResponseArguments, RequestKind, RequestSpecific, ResponseSpecific,
        StoreAckResponseArguments, StoreRequestArguments, ValueResponseArguments, VERSION,
    };
}
