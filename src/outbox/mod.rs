//! Side-Effect Outbox
//!
//! Graph mutations are atomic; calls to inventory, endpoint and credential
//! collaborators are not. Those calls are staged as records inside the same
//! topology transaction and delivered after commit by the dispatcher:
//!
//! - A record is removed only after its delivery succeeded
//! - Failed deliveries keep the record with `attempts` and `last_error`
//! - Records past the attempt budget are dead-lettered for operators

mod dispatcher;
mod effect;
mod queue;

pub use dispatcher::{DeliveryReport, SideEffectDispatcher};
pub use effect::{CredentialCall, EndpointCall, InventoryCall, ServiceLabels, SideEffect};
pub use queue::{DeliveryState, OutboxQueue, OutboxRecord};
