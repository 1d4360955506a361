//! Deterministic port assignment

use crate::errors::EngineError;

/// Assigns `base_port + project id`. Ports are never reclaimed.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    base_port: u16,
}

impl PortAllocator {
    pub fn new(base_port: u16) -> Self {
        Self { base_port }
    }

    pub fn allocate(&self, project_id: i64) -> Result<u16, EngineError> {
        u16::try_from(project_id)
            .ok()
            .and_then(|id| self.base_port.checked_add(id))
            .filter(|_| project_id > 0)
            .ok_or_else(|| {
                EngineError::ValidationError(format!(
                    "no port available for project {} above base port {}",
                    project_id, self.base_port
                ))
            })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(10000)
    }
}
