//! Registration of dependent watches
//!
//! Decides whether a child kind created or read on behalf of an owner should
//! be watched, and through which strategy. Registration is idempotent per
//! (owner controller, child kind, strategy).

use std::sync::Arc;

use kube::core::GroupVersionKind;
use tracing::{debug, error, info, instrument};

use super::{ControllerHandle, DependentWatch, EnqueueStrategy, EventSource};
use crate::controllermap::{ControllerMap, WatchSet};
use crate::discovery::{gvk_key, RestMapper, RestMapping};
use crate::metrics::prometheus::{DEPENDENT_WATCHES, DEPENDENT_WATCH_ERRORS};
use crate::owner::NamespacedOwnerReference;
use crate::{Error, Result};

/// Registers watches from child kinds back to owner controllers
pub struct DependentWatchRegistrar {
    mapper: Arc<dyn RestMapper>,
    controllers: Arc<dyn ControllerMap>,
    source: Arc<dyn EventSource>,
}

impl DependentWatchRegistrar {
    pub fn new(
        mapper: Arc<dyn RestMapper>,
        controllers: Arc<dyn ControllerMap>,
        source: Arc<dyn EventSource>,
    ) -> Self {
        Self {
            mapper,
            controllers,
            source,
        }
    }

    /// Ensure changes to `child` kinds re-trigger `owner`.
    ///
    /// `use_owner_ref` selects the owner-reference strategy; otherwise the
    /// annotation strategy is used for namespaced children, or cluster-scoped
    /// ones when the controller allows it. Disabled or blacklisted kinds are
    /// not an error. A missing controller entry is.
    #[instrument(skip_all, fields(kind = %child.kind, owner = %owner.kind))]
    pub async fn register(
        &self,
        owner: &NamespacedOwnerReference,
        child: &GroupVersionKind,
        use_owner_ref: bool,
    ) -> Result<()> {
        let child_mapping = self.mapper.mapping_for(child).await.map_err(|e| {
            error!(error = %e, kind = %gvk_key(child), "Could not get rest mapping");
            e
        })?;
        let owner_mapping = self.mapper.mapping_for(&owner.gvk()).await.map_err(|e| {
            error!(error = %e, owner = %gvk_key(&owner.gvk()), "Could not get rest mapping");
            e
        })?;

        let entry = self
            .controllers
            .get(&owner_mapping.gvk)
            .ok_or_else(|| Error::ControllerNotFound(gvk_key(&owner_mapping.gvk)))?;

        if !entry.watch_dependent_resources || entry.is_blacklisted(child) {
            info!(kind = %gvk_key(child), "Resource will not be watched/cached");
            return Ok(());
        }

        if use_owner_ref {
            let handler = EnqueueStrategy::Owner {
                owner: owner_mapping.gvk.clone(),
                owner_namespaced: owner_mapping.namespaced,
            };
            self.watch_once(&entry.owner_watches, entry.controller.as_ref(), &child_mapping, child, handler)
                .await
        } else if child_mapping.namespaced || entry.watch_cluster_scoped_resources {
            let handler = EnqueueStrategy::Annotation {
                owner: owner.group_kind(),
            };
            self.watch_once(
                &entry.annotation_watches,
                entry.controller.as_ref(),
                &child_mapping,
                child,
                handler,
            )
            .await
        } else {
            debug!(kind = %gvk_key(child), "Cluster-scoped dependent not watched");
            Ok(())
        }
    }

    /// Start one watch per child kind and strategy.
    ///
    /// The kind is reserved before the controller is asked to watch it. A
    /// concurrent caller that finds the reservation gets `Ok(())` straight
    /// away, even when the registration in flight later fails and releases
    /// the reservation.
    async fn watch_once(
        &self,
        watched: &WatchSet,
        controller: &dyn ControllerHandle,
        mapping: &RestMapping,
        child: &GroupVersionKind,
        handler: EnqueueStrategy,
    ) -> Result<()> {
        if !watched.insert(child) {
            return Ok(());
        }

        let strategy = handler.name();
        info!(kind = %gvk_key(child), strategy, "Watching child resource");

        let watch = DependentWatch {
            source: self.source.clone(),
            resource: mapping.api_resource(),
            handler,
        };
        if let Err(e) = controller.watch(watch).await {
            watched.remove(child);
            DEPENDENT_WATCH_ERRORS.with_label_values(&[strategy]).inc();
            error!(error = %e, kind = %gvk_key(child), strategy, "Failed to watch child resource");
            return Err(e);
        }

        DEPENDENT_WATCHES.with_label_values(&[strategy]).inc();
        Ok(())
    }
}
