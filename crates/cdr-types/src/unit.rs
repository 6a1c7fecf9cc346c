//! Deployment units and their lifecycle
//!
//! A unit is immutable after creation apart from its participants map and its
//! lifecycle state. Consumers `acquire()` a unit before use and `release()` it
//! when done. An undeploy request moves an Active unit to PendingUndeploy; the
//! release that drops the reference count to zero completes the transition to
//! Obsolete and notifies the owning store, which removes it.
//!
//! Units flagged `local` are pre-materialized identically on every node and are
//! immortal: every lifecycle transition is a no-op for them.

use crate::ids::{ContextId, NodeId};
use crate::mode::DeploymentMode;
use crate::participants::{ParticipantMap, Participants};
use crate::resource::{DeployedResource, ResourceBundle, ResourceMap};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifecycle state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    Active,
    PendingUndeploy,
    Obsolete,
}

/// Notified once when a unit becomes obsolete
pub trait ObsoleteHook: Send + Sync {
    fn on_obsolete(&self, unit: &DeploymentUnit);
}

/// Where a fetched unit's content came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOrigin {
    pub node: NodeId,
    pub context_id: ContextId,
}

#[derive(Debug)]
struct Lifecycle {
    state: UnitState,
    refs: usize,
    idle_since: Instant,
}

/// One deployed resource set plus its lifecycle state
pub struct DeploymentUnit {
    mode: DeploymentMode,
    context_id: ContextId,
    user_version: String,
    sample_resource: String,
    local: bool,
    resources: ResourceMap,
    participants: Option<Participants>,
    origin: Option<UnitOrigin>,
    parent: Option<ContextId>,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    hook: Option<Weak<dyn ObsoleteHook>>,
}

impl DeploymentUnit {
    /// Start building a unit for `sample_resource` under `mode`
    pub fn builder(
        mode: DeploymentMode,
        sample_resource: impl Into<String>,
        user_version: impl Into<String>,
    ) -> DeploymentUnitBuilder {
        DeploymentUnitBuilder {
            mode,
            context_id: None,
            user_version: user_version.into(),
            sample_resource: sample_resource.into(),
            resources: ResourceMap::new(),
            participants: ParticipantMap::new(),
            origin: None,
            parent: None,
            hook: None,
        }
    }

    /// The immortal unit of a node running without peer loading
    pub fn immortal(
        mode: DeploymentMode,
        node: &NodeId,
        user_version: impl Into<String>,
        sample_resource: impl Into<String>,
        resources: ResourceMap,
    ) -> Arc<Self> {
        Arc::new(Self {
            mode,
            context_id: ContextId::for_node(node),
            user_version: user_version.into(),
            sample_resource: sample_resource.into(),
            local: true,
            resources,
            participants: None,
            origin: None,
            parent: None,
            created_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: UnitState::Active,
                refs: 0,
                idle_since: Instant::now(),
            }),
            hook: None,
        })
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn user_version(&self) -> &str {
        &self.user_version
    }

    pub fn sample_resource(&self) -> &str {
        &self.sample_resource
    }

    /// True for immortal units materialized identically on every node
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&DeployedResource> {
        self.resources.get(name)
    }

    pub fn has_resource(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// True when the unit was deployed under `name` or contains it
    pub fn matches_name(&self, name: &str) -> bool {
        self.sample_resource == name || self.has_resource(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &DeployedResource> {
        self.resources.values().filter(|r| r.is_task())
    }

    /// Participants map; `None` for isolation-mode and local units
    pub fn participants(&self) -> Option<&Participants> {
        if self.local {
            return None;
        }
        self.participants.as_ref()
    }

    pub fn origin(&self) -> Option<UnitOrigin> {
        self.origin
    }

    /// Diagnostic lineage only
    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> UnitState {
        if self.local {
            return UnitState::Active;
        }
        self.lifecycle.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == UnitState::Active
    }

    pub fn is_pending_undeploy(&self) -> bool {
        self.state() == UnitState::PendingUndeploy
    }

    pub fn is_obsolete(&self) -> bool {
        self.state() == UnitState::Obsolete
    }

    /// Alias of [`is_obsolete`](Self::is_obsolete); always false for local units
    pub fn undeployed(&self) -> bool {
        self.is_obsolete()
    }

    pub fn ref_count(&self) -> usize {
        self.lifecycle.lock().refs
    }

    /// Take a reference. Fails once an undeploy has been scheduled.
    pub fn acquire(&self) -> bool {
        if self.local {
            return true;
        }
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != UnitState::Active {
            return false;
        }
        lifecycle.refs += 1;
        true
    }

    /// Drop a reference, completing a pending undeploy on the last one
    pub fn release(&self) {
        if self.local {
            return;
        }
        let obsoleted = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.refs = lifecycle.refs.saturating_sub(1);
            if lifecycle.refs > 0 {
                false
            } else {
                lifecycle.idle_since = Instant::now();
                if lifecycle.state == UnitState::PendingUndeploy {
                    lifecycle.state = UnitState::Obsolete;
                    true
                } else {
                    false
                }
            }
        };
        if obsoleted {
            self.notify_obsolete();
        }
    }

    /// Request undeploy. Moves the unit to PendingUndeploy while references
    /// remain, otherwise straight to Obsolete.
    ///
    /// Returns true if the state changed.
    pub fn schedule_undeploy(&self) -> bool {
        if self.local {
            return false;
        }
        let (changed, obsoleted) = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                UnitState::Active if lifecycle.refs == 0 => {
                    lifecycle.state = UnitState::Obsolete;
                    (true, true)
                }
                UnitState::Active => {
                    lifecycle.state = UnitState::PendingUndeploy;
                    (true, false)
                }
                UnitState::PendingUndeploy | UnitState::Obsolete => (false, false),
            }
        };
        if obsoleted {
            self.notify_obsolete();
        } else if changed {
            debug!(context_id = %self.context_id, sample = %self.sample_resource, "Undeploy scheduled");
        }
        changed
    }

    /// Make the unit obsolete immediately, regardless of outstanding references
    pub fn undeploy(&self) {
        if self.local {
            return;
        }
        let obsoleted = {
            let mut lifecycle = self.lifecycle.lock();
            let was_obsolete = lifecycle.state == UnitState::Obsolete;
            lifecycle.state = UnitState::Obsolete;
            !was_obsolete
        };
        if obsoleted {
            self.notify_obsolete();
        }
    }

    /// How long the unit has sat unreferenced; `None` while referenced,
    /// not active, or local
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        if self.local {
            return None;
        }
        let lifecycle = self.lifecycle.lock();
        if lifecycle.state != UnitState::Active || lifecycle.refs > 0 {
            return None;
        }
        Some(now.saturating_duration_since(lifecycle.idle_since))
    }

    /// Content needed to materialize this unit on another node
    pub fn bundle(&self) -> ResourceBundle {
        ResourceBundle {
            mode: self.mode,
            user_version: self.user_version.clone(),
            sample_resource: self.sample_resource.clone(),
            resources: self.resources.clone(),
        }
    }

    fn notify_obsolete(&self) {
        debug!(
            context_id = %self.context_id,
            sample = %self.sample_resource,
            mode = %self.mode,
            "Deployment unit obsolete"
        );
        if let Some(hook) = self.hook.as_ref().and_then(Weak::upgrade) {
            hook.on_obsolete(self);
        }
    }
}

impl fmt::Debug for DeploymentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentUnit")
            .field("mode", &self.mode)
            .field("context_id", &self.context_id)
            .field("user_version", &self.user_version)
            .field("sample_resource", &self.sample_resource)
            .field("local", &self.local)
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("participants", &self.participants().map(Participants::snapshot))
            .field("origin", &self.origin)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for DeploymentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unit[{} {} mode={} version={}{}]",
            self.context_id,
            self.sample_resource,
            self.mode,
            self.user_version,
            if self.local { " local" } else { "" }
        )
    }
}

/// Builder for non-local units
pub struct DeploymentUnitBuilder {
    mode: DeploymentMode,
    context_id: Option<ContextId>,
    user_version: String,
    sample_resource: String,
    resources: ResourceMap,
    participants: ParticipantMap,
    origin: Option<UnitOrigin>,
    parent: Option<ContextId>,
    hook: Option<Weak<dyn ObsoleteHook>>,
}

impl DeploymentUnitBuilder {
    /// Use a specific context id instead of generating one
    pub fn context_id(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn resources(mut self, resources: ResourceMap) -> Self {
        self.resources = resources;
        self
    }

    pub fn resource(mut self, resource: DeployedResource) -> Self {
        self.resources.insert(resource.name.clone(), resource);
        self
    }

    /// Seed participants; ignored for isolation modes
    pub fn participants(mut self, participants: ParticipantMap) -> Self {
        self.participants.extend(participants);
        self
    }

    pub fn origin(mut self, node: NodeId, context_id: ContextId) -> Self {
        self.origin = Some(UnitOrigin { node, context_id });
        self
    }

    pub fn parent(mut self, parent: Option<ContextId>) -> Self {
        self.parent = parent;
        self
    }

    /// Owner to notify when the unit becomes obsolete. Held weakly.
    pub fn on_obsolete<H: ObsoleteHook + 'static>(mut self, hook: &Arc<H>) -> Self {
        let hook: Arc<dyn ObsoleteHook> = hook.clone();
        self.hook = Some(Arc::downgrade(&hook));
        self
    }

    pub fn build(self) -> Arc<DeploymentUnit> {
        let participants = self
            .mode
            .is_per_version()
            .then(|| Participants::from_map(&self.participants));

        Arc::new(DeploymentUnit {
            mode: self.mode,
            context_id: self.context_id.unwrap_or_else(ContextId::generate),
            user_version: self.user_version,
            sample_resource: self.sample_resource,
            local: false,
            resources: self.resources,
            participants,
            origin: self.origin,
            parent: self.parent,
            created_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: UnitState::Active,
                refs: 0,
                idle_since: Instant::now(),
            }),
            hook: self.hook,
        })
    }
}
