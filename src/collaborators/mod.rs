//! External Collaborators
//!
//! Interface boundary of every system the control plane talks to but does
//! not own: inventory / service directory, access endpoints (DNS, load
//! balancer, service mesh), the credential store, the remote executor and
//! the health probe.
//!
//! All traits are synchronous and object safe. `memory` provides
//! recording implementations.

mod credentials;
mod endpoint;
mod errors;
mod executor;
mod inventory;
pub mod memory;
mod probe;

pub use credentials::CredentialStore;
pub use endpoint::{EndpointProvider, EndpointRegistry};
pub use errors::{CollaboratorError, CollaboratorResult};
pub use executor::{JobRequest, RemoteExecutor, RemoteJobId, RemoteJobStatus};
pub use inventory::InventoryClient;
pub use probe::{HealthProbe, InstanceProbe};
