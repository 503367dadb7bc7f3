//! Shared collaborators of every transaction.

use std::sync::Arc;

use super::id::XidFactory;
use crate::resource::ResourceRegistry;
use crate::txlog::TransactionStore;

/// Store, registry and id factory, built once at startup and shared.
#[derive(Clone)]
pub struct TransactionServices {
    pub store: Arc<dyn TransactionStore>,
    pub registry: Arc<ResourceRegistry>,
    pub xid_factory: Arc<XidFactory>,
}

impl TransactionServices {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        registry: Arc<ResourceRegistry>,
        xid_factory: Arc<XidFactory>,
    ) -> Self {
        Self {
            store,
            registry,
            xid_factory,
        }
    }
}
