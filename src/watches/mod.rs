//! Dependent watches from child resources back to their owners

pub mod enqueue;
pub mod registrar;

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use tokio::sync::broadcast;

pub use enqueue::{QueueController, ReconcileRequest};
pub use registrar::DependentWatchRegistrar;

use crate::discovery::GroupKind;
use crate::Result;

/// Change to an object seen by an informer
#[derive(Clone, Debug)]
pub enum ObjectEvent {
    /// Object present in the initial list of a (re)started watch
    Listed(Arc<DynamicObject>),
    /// Object created or updated
    Applied(Arc<DynamicObject>),
    Deleted(Arc<DynamicObject>),
}

/// Live events of one resource plus the objects already known
pub struct Subscription {
    pub events: broadcast::Receiver<ObjectEvent>,
    pub existing: Vec<Arc<DynamicObject>>,
}

/// Source of object events for a resource
#[cfg_attr(test, mockall::automock)]
pub trait EventSource: Send + Sync {
    fn subscribe(&self, resource: &ApiResource) -> Result<Subscription>;
}

/// How child events are turned into owner reconcile requests
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueStrategy {
    /// Follow the child's `metadata.ownerReferences` to owners of this kind
    Owner {
        owner: GroupVersionKind,
        owner_namespaced: bool,
    },
    /// Follow the primary resource annotations naming this owner type
    Annotation { owner: GroupKind },
}

impl EnqueueStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            EnqueueStrategy::Owner { .. } => "owner_reference",
            EnqueueStrategy::Annotation { .. } => "annotation",
        }
    }
}

/// A request to watch a child kind on behalf of an owner controller
#[derive(Clone)]
pub struct DependentWatch {
    pub source: Arc<dyn EventSource>,
    pub resource: ApiResource,
    pub handler: EnqueueStrategy,
}

/// Underlying watch registration mechanism of a controller
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControllerHandle: Send + Sync {
    /// Start routing events of `watch.resource` to the owner, filtered by
    /// the dependent predicate
    async fn watch(&self, watch: DependentWatch) -> Result<()>;
}
