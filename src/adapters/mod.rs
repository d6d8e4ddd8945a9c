//! Adapters between the reconciliation core and the Kubernetes API

mod object_store;

pub use object_store::*;
