//! Cluster driver gateway
//!
//! The narrow boundary between the provisioning controllers and the engines
//! that actually build clusters:
//!
//! - [`ClusterDriver`]: create/update/remove a cluster from a [`crds::DriverSpec`]
//! - [`DriverRegistry`] / [`DriverGateway`]: explicit name to driver lookup
//! - [`Dialer`]: resolves `<namespace>:<name>` node references to connectors
//! - [`EncryptedStore`]: opaque blob storage for connection material and
//!   machine working state
//! - [`ApiValidator`]: live discovery check of a freshly provisioned endpoint
//! - [`CredentialExchanger`]: derives credentials for imported clusters
//!
//! Driver calls report progress through a [`DriverLogger`], whose events the
//! caller relays onto the cluster's conditions.

pub mod command;
pub mod dialer;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod logstream;
pub mod process;
pub mod store;
pub mod validate;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use command::CommandDriver;
pub use dialer::{Connector, Dialer, StoreDialer, delete_connector, node_key, save_connector};
pub use driver::{ClusterDriver, ClusterInfo, DriverGateway, DriverRegistry};
pub use error::{BlobStoreError, DialError, DriverError, ExchangeError, ValidationError};
pub use exchange::{CredentialExchanger, KubeconfigExchanger};
pub use logstream::{DriverContext, DriverEvent, DriverLogger, EventLevel, log_stream};
pub use store::{EncryptedStore, SecretStore};
pub use validate::{ApiValidator, DiscoveryValidator};
