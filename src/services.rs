use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Container of shared services handed to every box routine.
///
/// The engine never looks inside: it is a boundary collaborator that carries
/// whatever the embedding application registered (clients, caches, ...).
/// Services are keyed by name and downcast on retrieval.
#[derive(Default, Clone)]
pub struct ServiceProvider {
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any + Send + Sync>(&mut self, name: &str, service: Arc<T>) {
        self.services.insert(name.to_string(), service);
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services
            .get(name)
            .and_then(|s| s.clone().downcast::<T>().ok())
    }
}
