//! State shared by the adapter and every entity it creates.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use blelink_types::RadioState;

use crate::config::BleConfig;
use crate::entity::{EntityKey, EntityKind};
use crate::events::{BleEvent, EventDispatcher, StateField};
use crate::metrics::EntityMetrics;
use crate::signal::SignalBounds;
use crate::sink::FailureSink;
use crate::watch::Watched;

/// Adapter-wide services.
pub struct BleContext {
    pub(crate) config: BleConfig,
    pub(crate) events: EventDispatcher,
    pub(crate) sink: Arc<dyn FailureSink>,
    pub(crate) bounds: SignalBounds,
    pub(crate) radio: Watched<RadioState>,
}

impl BleContext {
    pub(crate) fn new(config: BleConfig, sink: Arc<dyn FailureSink>) -> Arc<Self> {
        Arc::new(Self {
            events: EventDispatcher::new(config.channels.events),
            bounds: SignalBounds::new(config.signal.initial_closest, config.signal.initial_farthest),
            radio: Watched::new(RadioState::Unknown),
            sink,
            config,
        })
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn bounds(&self) -> &SignalBounds {
        &self.bounds
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio.get()
    }
}

impl fmt::Debug for BleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleContext")
            .field("config", &self.config)
            .field("radio", &self.radio)
            .finish_non_exhaustive()
    }
}

/// Identity of one entity plus the adapter services it reports through.
#[derive(Clone)]
pub(crate) struct EntityScope {
    pub(crate) ctx: Arc<BleContext>,
    pub(crate) key: EntityKey,
    pub(crate) metrics: Arc<EntityMetrics>,
}

impl EntityScope {
    pub(crate) fn new(ctx: Arc<BleContext>, key: EntityKey) -> Self {
        Self {
            ctx,
            key,
            metrics: Arc::new(EntityMetrics::new()),
        }
    }

    /// Scope of a service or characteristic below this entity.
    pub(crate) fn child(&self, kind: EntityKind, uuid: &Uuid, handle: u16) -> Self {
        Self::new(Arc::clone(&self.ctx), self.key.child(kind, uuid, handle))
    }

    pub(crate) fn emit(&self, event: BleEvent) {
        self.ctx.events.send(event);
    }

    pub(crate) fn emit_state(&self, field: StateField, value: bool) {
        tracing::debug!(entity = %self.key, ?field, value, "State changed");
        self.emit(BleEvent::StateChanged {
            entity: self.key.clone(),
            field,
            value,
        });
    }
}

impl fmt::Debug for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityScope").field(&self.key).finish()
    }
}
