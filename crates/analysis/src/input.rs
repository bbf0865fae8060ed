//! Input storage collaborator: "given a tenant and a resource reference,
//! assert existence and return a location".

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use complyflow_core::TenantId;

use crate::payload::{InputLocation, InputRef};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("input '{0}' not found for tenant")]
    NotFound(String),

    #[error("input storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait InputLocator: Send + Sync {
    async fn locate(&self, tenant_id: TenantId, input_ref: &InputRef) -> Result<InputLocation, InputError>;
}

/// In-memory locator for tests/dev.
///
/// With `accept_any` set, every reference resolves to
/// `memory://<tenant>/<ref>`; otherwise only registered references do.
#[derive(Debug, Default)]
pub struct InMemoryInputLocator {
    inputs: RwLock<HashMap<(TenantId, InputRef), InputLocation>>,
    accept_any: bool,
}

impl InMemoryInputLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_any() -> Self {
        Self {
            inputs: RwLock::new(HashMap::new()),
            accept_any: true,
        }
    }

    pub fn register(&self, tenant_id: TenantId, input_ref: InputRef, location: InputLocation) {
        self.inputs
            .write()
            .expect("input locator lock poisoned")
            .insert((tenant_id, input_ref), location);
    }
}

#[async_trait]
impl InputLocator for InMemoryInputLocator {
    async fn locate(&self, tenant_id: TenantId, input_ref: &InputRef) -> Result<InputLocation, InputError> {
        let inputs = self.inputs.read().expect("input locator lock poisoned");
        if let Some(location) = inputs.get(&(tenant_id, input_ref.clone())) {
            return Ok(location.clone());
        }
        if self.accept_any {
            return Ok(InputLocation {
                uri: format!("memory://{tenant_id}/{input_ref}"),
            });
        }
        Err(InputError::NotFound(input_ref.to_string()))
    }
}
