//! Handler registration table
//!
//! Handlers are registered by (protocol version, action) when a module is
//! assembled. The table is immutable afterwards and shared by every
//! concurrent dispatch.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use csms_core::{Message, OcppVersion};

use crate::module::Module;
use crate::DispatchError;

pub type HandlerFuture = BoxFuture<'static, Result<(), DispatchError>>;

/// Handler invoked with the owning module and the inbound envelope
pub type Handler = Arc<dyn Fn(Arc<Module>, Message) -> HandlerFuture + Send + Sync>;

/// Immutable (version, action) -> handler map
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<(OcppVersion, String), Handler>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn get(&self, version: OcppVersion, action: &str) -> Option<Handler> {
        self.handlers.get(&(version, action.to_string())).cloned()
    }

    /// Distinct actions with a handler under any version, sorted
    pub fn actions(&self) -> Vec<String> {
        self.handlers
            .keys()
            .map(|(_, action)| action.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<(OcppVersion, String), Handler>,
}

impl HandlerTableBuilder {
    /// Register `handler` for `action` under `version`, replacing any earlier one
    pub fn on<F, Fut>(mut self, version: OcppVersion, action: &str, handler: F) -> Self
    where
        F: Fn(Arc<Module>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |module, message| handler(module, message).boxed());
        self.handlers.insert((version, action.to_string()), handler);
        self
    }

    /// Register the same handler under several versions
    pub fn on_versions<F, Fut>(mut self, versions: &[OcppVersion], action: &str, handler: F) -> Self
    where
        F: Fn(Arc<Module>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let shared = Arc::new(handler);
        for version in versions {
            let shared = shared.clone();
            self = self.on(*version, action, move |module, message| (*shared)(module, message));
        }
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}
