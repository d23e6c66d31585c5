//! Transparent-return opt-in
//!
//! Registers the indexable `ret.specialize` descriptor with a non-zero
//! default, opting every block's returns into edge-based specialisation.
//! Without this client, returns use the conservative identity translation.

use grist_engine::client::Client;
use grist_engine::meta::{CompareMode, MetaError, MetaKind, MetaRegistry};
use grist_engine::InitReason;

/// Opts returns into specialised (edge-dispatched) translation.
#[derive(Default)]
pub struct TransparentReturns;

impl TransparentReturns {
    pub fn new() -> TransparentReturns {
        TransparentReturns
    }
}

impl Client for TransparentReturns {
    fn on_init(&self, _reason: InitReason, registry: &mut MetaRegistry) -> Result<(), MetaError> {
        registry.register("ret.specialize", MetaKind::Indexable, CompareMode::Exact, 1)?;
        Ok(())
    }
}
