use crate::call_context::{CallContext, Context};
use crate::instance::{InstantiationError, LinkError, ModuleInstance};
use crate::sync::RwLock;
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;

/// A registry of module instances keyed by name, within which imports are
/// resolved.
///
/// Instantiation first reserves a name and publishes the instance under it
/// only once instantiation succeeds, so a module is never visible to importers
/// half-built and two instantiations can never claim the same name.
#[derive(Debug, Default)]
pub struct Namespace {
    inner: RwLock<NamespaceInner>,
}

#[derive(Debug, Default)]
struct NamespaceInner {
    /// `None` marks a reserved name whose instantiation is in progress.
    modules: HashMap<String, Option<Arc<ModuleInstance>>>,
    /// Published names in initialization order.
    names: Vec<String>,
}

impl Namespace {
    pub(crate) fn new() -> Namespace {
        Namespace::default()
    }

    /// Returns the published instances named by `names`.
    pub(crate) fn require_modules(
        &self,
        names: &HashSet<&str>,
    ) -> Result<HashMap<String, Arc<ModuleInstance>>, LinkError> {
        let inner = self.inner.read();
        names
            .iter()
            .map(|&name| match inner.modules.get(name) {
                Some(Some(module)) => Ok((name.to_string(), module.clone())),
                _ => Err(LinkError::ModuleNotInstantiated(name.to_string())),
            })
            .collect()
    }

    /// Reserves `name` for an instantiation in progress.
    pub(crate) fn require_module_name(&self, name: &str) -> Result<(), InstantiationError> {
        let mut inner = self.inner.write();
        if inner.modules.contains_key(name) {
            return Err(InstantiationError::NameTaken(name.to_string()));
        }
        inner.modules.insert(name.to_string(), None);
        log::debug!("reserved module[{name}]");
        Ok(())
    }

    /// Publishes an instance under its reserved name.
    pub(crate) fn add_module(&self, module: Arc<ModuleInstance>) {
        let mut inner = self.inner.write();
        let name = module.name().to_string();
        inner.modules.insert(name.clone(), Some(module));
        log::debug!("published module[{name}]");
        inner.names.push(name);
    }

    /// Removes a published instance or a reservation.
    pub(crate) fn delete_module(&self, name: &str) {
        let mut inner = self.inner.write();
        if inner.modules.remove(name).is_some() {
            inner.names.retain(|n| n != name);
            log::debug!("deleted module[{name}]");
        }
    }

    /// A call context for the published module `name`.
    pub fn module(&self, name: &str) -> Option<CallContext> {
        let inner = self.inner.read();
        match inner.modules.get(name) {
            Some(Some(module)) => Some(module.call_context()),
            _ => None,
        }
    }

    /// Names of the published modules, in initialization order.
    pub fn module_names(&self) -> Vec<String> {
        self.inner.read().names.clone()
    }

    /// Closes every published module in reverse initialization order.
    ///
    /// All modules are closed even if some fail; the first error is returned.
    pub fn close_with_exit_code(&self, ctx: &Context, exit_code: u32) -> anyhow::Result<()> {
        let modules: Vec<Arc<ModuleInstance>> = {
            let mut inner = self.inner.write();
            let names = std::mem::take(&mut inner.names);
            names
                .iter()
                .rev()
                .filter_map(|name| inner.modules.remove(name).flatten())
                .collect()
        };
        let mut result = Ok(());
        for module in modules {
            let closed = module.close_with_exit_code(ctx, exit_code);
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }
}
