//! Built-in capability providers.
//!
//! Every capability in the system — built-in or site-specific — reaches the
//! registry through the same [`CapabilityProvider`](crate::dispatch::loader::CapabilityProvider)
//! contract, bound to a module manifest by the loader. The built-ins cover
//! dispatcher introspection; domain operations against the host CAD API are
//! site modules compiled in alongside these.

mod system;

pub use system::SystemProvider;

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::loader::CapabilityProvider;

/// Returns the compiled-in provider set, keyed by manifest entry name.
#[must_use]
pub fn builtin_providers(system: SystemProvider) -> HashMap<String, Arc<dyn CapabilityProvider>> {
    let mut providers: HashMap<String, Arc<dyn CapabilityProvider>> = HashMap::new();
    providers.insert("system".to_string(), Arc::new(system));
    providers
}
