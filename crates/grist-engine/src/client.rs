//! Client plug-in API
//!
//! Instrumentation tools implement [`Client`] and register under a stable
//! string name. The translator invokes the hooks at fixed points of the
//! pipeline; every hook has a no-op default so clients implement only what
//! they need. Clients register their metadata descriptors from `on_init`.

use crate::meta::{MetaError, MetaRegistry};
use crate::trace::{BlockFactory, BlockId, Trace};

/// Why the translator is initialising or shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitReason {
    Program,
    Thread,
    Attach,
    Detach,
}

/// Kinds of entry points into translated execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointKind {
    UserAttach,
    UserLoad,
    KernelSyscall,
    ModuleInit,
    ModuleExit,
    ModuleCallback,
    UserSignal,
}

/// An instrumentation client.
#[allow(unused_variables)]
pub trait Client: Send + Sync {
    /// Called once per init reason; register metadata descriptors here.
    fn on_init(&self, reason: InitReason, registry: &mut MetaRegistry) -> Result<(), MetaError> {
        Ok(())
    }

    /// Called on shutdown.
    fn on_exit(&self, reason: InitReason) {}

    /// Inspect and mutate a freshly decoded block in place.
    fn on_instrument_block(&self, trace: &mut Trace, block: BlockId) {}

    /// Inspect the whole trace; may materialise successor future blocks
    /// and rewrite control flow through the factory.
    fn on_instrument_control_flow(&self, factory: &mut BlockFactory<'_>) {}

    /// Fill in a compensation block gluing entry-point state onto its
    /// target.
    fn on_instrument_entry_point(
        &self,
        factory: &mut BlockFactory<'_>,
        compensation: BlockId,
        kind: EntryPointKind,
        category: u32,
    ) {
    }
}

/// Error registering a client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("client {0:?} already registered")]
    DuplicateName(String),
    #[error("client registration is closed once translation has started")]
    RegistrationClosed,
}

/// The registered client table, invoked in registration order.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Vec<(String, Box<dyn Client>)>,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry::default()
    }

    pub fn register(&mut self, name: &str, client: Box<dyn Client>) -> Result<(), ClientError> {
        if self.clients.iter().any(|(existing, _)| existing == name) {
            return Err(ClientError::DuplicateName(name.to_string()));
        }
        self.clients.push((name.to_string(), client));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Client)> {
        self.clients.iter().map(|(name, client)| (name.as_str(), client.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Client for Nop {}

    #[test]
    fn test_register_and_iterate() {
        let mut registry = ClientRegistry::new();
        registry.register("count_blocks", Box::new(Nop)).unwrap();
        registry.register("watchpoints", Box::new(Nop)).unwrap();
        let names: Vec<_> = registry.iter().map(|(name, _)| name.to_string()).collect();
        assert_eq!(names, vec!["count_blocks", "watchpoints"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ClientRegistry::new();
        registry.register("tool", Box::new(Nop)).unwrap();
        assert!(matches!(
            registry.register("tool", Box::new(Nop)),
            Err(ClientError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let client = Nop;
        let mut registry = MetaRegistry::new();
        client.on_init(InitReason::Program, &mut registry).unwrap();
        client.on_exit(InitReason::Detach);
    }
}
