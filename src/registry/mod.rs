pub mod loader;
pub mod store;
pub mod types;
pub mod watcher;

pub use loader::{create_example_registry, load_registry, AppEntry, StaticRegistry};
pub use store::{InMemoryServiceStore, ServiceStore};
pub use types::{
    Endpoint, RegistryEvent, ServerDescriptor, ServiceDescriptor, ServiceEntry, ServiceKey,
};
pub use watcher::RegistryWatcher;
