use std::sync::Arc;

use kiln_compute::{InnerTaskManager, TokenAllocator};
use kiln_core::{EnvironmentId, ExecutionEnvironment};

/// Resources of one execution environment: its properties, its token pool
/// and the engine that runs inner tasks there.
pub struct ExecutionSite {
    environment: ExecutionEnvironment,
    allocator: Arc<TokenAllocator>,
    manager: InnerTaskManager,
}

impl ExecutionSite {
    pub fn new(environment: ExecutionEnvironment, allocator: Arc<TokenAllocator>) -> Self {
        let manager = InnerTaskManager::new(Arc::clone(&allocator), environment.id());
        Self {
            environment,
            allocator,
            manager,
        }
    }

    pub fn environment(&self) -> &ExecutionEnvironment {
        &self.environment
    }

    pub fn environment_id(&self) -> EnvironmentId {
        self.environment.id()
    }

    pub fn allocator(&self) -> &Arc<TokenAllocator> {
        &self.allocator
    }

    pub fn manager(&self) -> &InnerTaskManager {
        &self.manager
    }

    /// Interrupt and join every inner task running here.
    pub fn close(&self) {
        self.manager.close();
    }
}
