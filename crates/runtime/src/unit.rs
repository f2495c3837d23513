//! Code units: the runtime's unit of loadable, rewritable code.

use std::fmt;
use std::sync::Arc;

/// Error returned by a prologue hook. Surfaces keep it as the source of
/// their own error type.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Code run before a method body.
///
/// Hooks are inserted by transformers. The `id` identifies a hook across
/// rewrites so the same hook is never inserted twice into one method.
pub trait Hook: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn enter(&self, unit: &str, method: &str) -> Result<(), HookError>;
}

/// A method declared by a unit, with its prologue.
#[derive(Debug, Clone)]
pub struct Method {
    signature: String,
    prologue: Vec<Arc<dyn Hook>>,
}

impl Method {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            prologue: Vec::new(),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn prologue(&self) -> &[Arc<dyn Hook>] {
        &self.prologue
    }

    pub fn has_hook(&self, id: &str) -> bool {
        self.prologue.iter().any(|h| h.id() == id)
    }

    /// Insert `hook` at the front of the prologue.
    ///
    /// Returns `false`, leaving the prologue untouched, if a hook with the
    /// same id is already present.
    pub fn insert_hook(&mut self, hook: Arc<dyn Hook>) -> bool {
        if self.has_hook(hook.id()) {
            return false;
        }
        self.prologue.insert(0, hook);
        true
    }

    fn enter(&self, unit: &str) -> Result<(), HookError> {
        for hook in &self.prologue {
            hook.enter(unit, &self.signature)?;
        }
        Ok(())
    }
}

/// A named unit of code: an ordered list of methods.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    name: String,
    methods: Vec<Method>,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Declare a method.
    pub fn method(mut self, signature: impl Into<String>) -> Self {
        self.methods.push(Method::new(signature));
        self
    }

    /// Declare several methods.
    pub fn methods<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.extend(signatures.into_iter().map(Method::new));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared(&self) -> &[Method] {
        &self.methods
    }

    pub fn find(&self, signature: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.signature == signature)
    }

    pub fn find_mut(&mut self, signature: &str) -> Option<&mut Method> {
        self.methods.iter_mut().find(|m| m.signature == signature)
    }

    /// Run the prologue of `signature`.
    ///
    /// Methods the unit does not declare have no prologue.
    pub fn enter(&self, signature: &str) -> Result<(), HookError> {
        match self.find(signature) {
            Some(method) => method.enter(&self.name),
            None => Ok(()),
        }
    }
}
