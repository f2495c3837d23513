//! Unit definitions, load-once linking and retransformation.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::instrument::{AgentState, Agents, Attachment, Transformer};
use crate::naming::Namespace;
use crate::unit::{CodeUnit, HookError};
use crate::{Error, Result, http, memory, naming, process, reflect, registry, serial};

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// Instrumentation features the host supports.
#[derive(Debug, Clone, Copy)]
struct Features {
    transform: bool,
    retransform: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            transform: true,
            retransform: true,
        }
    }
}

/// The host runtime.
///
/// Holds unit definitions, links units on first use, and runs registered
/// transformers over each unit before it becomes active.
pub struct Runtime {
    definitions: DashMap<String, Arc<CodeUnit>>,
    loaded: DashMap<String, Arc<OnceCell<Arc<Slot>>>>,
    transformers: RwLock<Vec<Arc<dyn Transformer>>>,
    features: Features,
    agents: Agents,
    namespace: Arc<Namespace>,
}

/// Builder for [`Runtime`].
#[derive(Debug, Default)]
pub struct Builder {
    features: Features,
}

impl Builder {
    /// Whether transformers may be registered.
    pub fn transform(mut self, supported: bool) -> Self {
        self.features.transform = supported;
        self
    }

    /// Whether loaded units may be retransformed.
    pub fn retransform(mut self, supported: bool) -> Self {
        self.features.retransform = supported;
        self
    }

    pub fn build(self) -> Runtime {
        let runtime = Runtime {
            definitions: DashMap::new(),
            loaded: DashMap::new(),
            transformers: RwLock::new(Vec::new()),
            features: self.features,
            agents: Agents::default(),
            namespace: Arc::new(Namespace::default()),
        };
        for unit in bootstrap_units() {
            runtime
                .definitions
                .insert(unit.name().to_string(), Arc::new(unit));
        }
        runtime
    }
}

/// Units for the host-supplied surfaces.
fn bootstrap_units() -> Vec<CodeUnit> {
    vec![
        naming::unit(),
        registry::unit(),
        process::runtime_unit(),
        process::builder_unit(),
        http::provider_unit(),
        serial::output_unit(),
        serial::input_unit(),
        memory::unit(),
        reflect::unit(),
    ]
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// A runtime supporting every instrumentation feature.
    pub fn new() -> Self {
        Builder::default().build()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The process-wide runtime.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(Runtime::new)
    }

    /// Register a unit definition.
    pub fn define(&self, unit: CodeUnit) -> Result<()> {
        match self.definitions.entry(unit.name().to_string()) {
            Entry::Occupied(e) => Err(Error::AlreadyDefined(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(Arc::new(unit));
                Ok(())
            }
        }
    }

    /// The definition of `name`, as registered (untransformed).
    pub fn definition(&self, name: &str) -> Option<Arc<CodeUnit>> {
        self.definitions.get(name).map(|d| Arc::clone(&d))
    }

    /// Load `name`, linking it on first use.
    ///
    /// Linking happens once per unit even when several threads race to
    /// load it; every caller gets a handle to the same slot.
    pub fn load(&self, name: &str) -> Result<UnitHandle> {
        let cell = match self.loaded.get(name) {
            Some(cell) => Arc::clone(&cell),
            None if !self.definitions.contains_key(name) => {
                return Err(Error::NotDefined(name.to_string()));
            }
            None => Arc::clone(&self.loaded.entry(name.to_string()).or_default()),
        };
        if let Some(slot) = cell.get() {
            return Ok(UnitHandle::new(slot));
        }

        // Held across linking so a transformer registered meanwhile either
        // sees this unit in `loaded_units` or is applied to it here.
        let transformers = self
            .transformers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = cell.get_or_try_init(|| self.link(name, &transformers))?;
        Ok(UnitHandle::new(slot))
    }

    fn link(&self, name: &str, transformers: &[Arc<dyn Transformer>]) -> Result<Arc<Slot>> {
        let definition = self
            .definition(name)
            .ok_or_else(|| Error::NotDefined(name.to_string()))?;
        let unit = apply(transformers, CodeUnit::clone(&definition));
        debug!(unit = name, "linked");
        Ok(Arc::new(Slot::new(unit)))
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded
            .get(name)
            .is_some_and(|cell| cell.get().is_some())
    }

    /// Names of all linked units.
    pub fn loaded_units(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .loaded
            .iter()
            .filter(|e| e.value().get().is_some())
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Register a transformer for units linked from now on.
    pub fn add_transformer(&self, transformer: Arc<dyn Transformer>) -> Result<()> {
        if !self.features.transform {
            return Err(Error::Unsupported("transformation"));
        }
        let mut transformers = self
            .transformers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if transformers.iter().any(|t| t.name() == transformer.name()) {
            return Err(Error::DuplicateTransformer(transformer.name().to_string()));
        }
        info!(transformer = transformer.name(), "transformer registered");
        transformers.push(transformer);
        Ok(())
    }

    pub fn can_retransform(&self) -> bool {
        self.features.retransform
    }

    /// Offer already-linked units to the transformers again.
    ///
    /// Names that are not loaded are skipped. Returns the number of units
    /// processed.
    pub fn retransform<S: AsRef<str>>(&self, names: &[S]) -> Result<usize> {
        if !self.features.retransform {
            return Err(Error::Unsupported("retransformation"));
        }
        let transformers = self
            .transformers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut count = 0;
        for name in names {
            let name = name.as_ref();
            let Some(slot) = self.loaded.get(name).and_then(|cell| cell.get().cloned()) else {
                continue;
            };
            let _rewrite = slot.rewrite.lock().unwrap_or_else(PoisonError::into_inner);
            let current = slot.active.load_full();
            let unit = apply(&transformers, CodeUnit::clone(&current));
            slot.active.store(Arc::new(unit));
            debug!(unit = name, "retransformed");
            count += 1;
        }
        Ok(count)
    }

    /// Begin installing `agent`. Only an agent that never attached before
    /// may attach.
    pub fn attach(&self, agent: &str) -> Result<Attachment<'_>> {
        if !self.agents.begin(agent) {
            return Err(Error::AlreadyAttached(agent.to_string()));
        }
        Ok(Attachment::new(&self.agents, agent))
    }

    pub fn agent_state(&self, agent: &str) -> AgentState {
        self.agents.state(agent)
    }

    pub(crate) fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("definitions", &self.definitions.len())
            .field("loaded", &self.loaded_units())
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

/// Run each transformer over `unit` in registration order.
fn apply(transformers: &[Arc<dyn Transformer>], mut unit: CodeUnit) -> CodeUnit {
    for transformer in transformers {
        let mut candidate = unit.clone();
        match transformer.transform(&mut candidate) {
            Ok(true) => {
                debug!(transformer = transformer.name(), unit = unit.name(), "unit rewritten");
                unit = candidate;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    transformer = transformer.name(),
                    unit = unit.name(),
                    error = %e,
                    "transformer failed, unit left unchanged"
                );
            }
        }
    }
    unit
}

struct Slot {
    name: String,
    active: ArcSwap<CodeUnit>,
    rewrite: Mutex<()>,
}

impl Slot {
    fn new(unit: CodeUnit) -> Self {
        Self {
            name: unit.name().to_string(),
            active: ArcSwap::from_pointee(unit),
            rewrite: Mutex::new(()),
        }
    }
}

/// A loaded unit.
///
/// Cheap to clone. Always refers to the unit's active definition, which
/// retransformation may replace.
#[derive(Clone)]
pub struct UnitHandle {
    slot: Arc<Slot>,
}

impl UnitHandle {
    fn new(slot: &Arc<Slot>) -> Self {
        Self {
            slot: Arc::clone(slot),
        }
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Snapshot of the active definition.
    pub fn active(&self) -> Arc<CodeUnit> {
        self.slot.active.load_full()
    }

    /// Run the active prologue of `signature`.
    pub fn enter(&self, signature: &str) -> std::result::Result<(), HookError> {
        self.slot.active.load().enter(signature)
    }
}

impl fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UnitHandle").field(&self.slot.name).finish()
    }
}
