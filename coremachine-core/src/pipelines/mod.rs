//! Built-in pipelines, registered by both binaries at startup. The worker
//! needs the handlers; the API only resolves the specs for validation.

use crate::registry::HandlerRegistry;

pub mod hello_world;

pub fn register_builtin(registry: &mut HandlerRegistry) {
    hello_world::register(registry);
}
