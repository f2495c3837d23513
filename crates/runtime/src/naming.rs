//! Hierarchical naming service.
//!
//! Every runtime owns one in-process namespace. An [`InitialContext`] is the
//! entry into it: names are `/`-separated paths, bound values are JSON
//! objects or subcontexts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use thiserror::Error;

use crate::Runtime;
use crate::loader::UnitHandle;
use crate::unit::{CodeUnit, HookError};

pub const UNIT: &str = "naming.InitialContext";

/// Definition of the initial context unit.
pub fn unit() -> CodeUnit {
    CodeUnit::new(UNIT).methods([
        "lookup",
        "bind",
        "rebind",
        "unbind",
        "rename",
        "list",
        "list_bindings",
        "destroy_subcontext",
        "create_subcontext",
        "lookup_link",
        "get_name_parser",
        "add_to_environment",
        "remove_from_environment",
        "get_environment",
        "get_name_in_namespace",
        "close",
    ])
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NamingError {
    #[error("no initial context available")]
    NoInitialContext {
        #[source]
        source: HookError,
    },

    #[error("name not found: {0}")]
    NameNotFound(String),

    #[error("name already bound: {0}")]
    NameAlreadyBound(String),

    #[error("not a context: {0}")]
    NotContext(String),

    #[error("context not empty: {0}")]
    ContextNotEmpty(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    Load(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, NamingError>;

/// What a name is bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Object(Value),
    /// A subcontext, identified by its full name.
    Context(String),
}

/// A name and the kind of thing bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameClassPair {
    pub name: String,
    pub class: &'static str,
}

#[derive(Debug, Clone)]
enum Node {
    Object(Value),
    Context(BTreeMap<String, Node>),
}

impl Node {
    fn class(&self) -> &'static str {
        match self {
            Node::Object(_) => "object",
            Node::Context(_) => "context",
        }
    }
}

/// Storage behind every context of a runtime.
#[derive(Debug)]
pub(crate) struct Namespace {
    root: RwLock<BTreeMap<String, Node>>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            root: RwLock::new(BTreeMap::new()),
        }
    }
}

/// Parses composite names.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameParser;

impl NameParser {
    /// Split `name` into components. The empty name is the root.
    pub fn parse(&self, name: &str) -> Result<Vec<String>> {
        if name.is_empty() {
            return Ok(Vec::new());
        }
        let parts: Vec<String> = name.split('/').map(str::to_string).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(NamingError::InvalidName(name.to_string()));
        }
        Ok(parts)
    }
}

fn walk<'a>(
    mut ctx: &'a BTreeMap<String, Node>,
    path: &[String],
    full: &str,
) -> Result<&'a BTreeMap<String, Node>> {
    for part in path {
        match ctx.get(part) {
            Some(Node::Context(next)) => ctx = next,
            Some(Node::Object(_)) => return Err(NamingError::NotContext(full.to_string())),
            None => return Err(NamingError::NameNotFound(full.to_string())),
        }
    }
    Ok(ctx)
}

fn walk_mut<'a>(
    mut ctx: &'a mut BTreeMap<String, Node>,
    path: &[String],
    full: &str,
) -> Result<&'a mut BTreeMap<String, Node>> {
    for part in path {
        match ctx.get_mut(part) {
            Some(Node::Context(next)) => ctx = next,
            Some(Node::Object(_)) => return Err(NamingError::NotContext(full.to_string())),
            None => return Err(NamingError::NameNotFound(full.to_string())),
        }
    }
    Ok(ctx)
}

/// Entry point into a runtime's naming service.
///
/// Every operation is a lookup-capability entry point.
#[derive(Debug)]
pub struct InitialContext {
    unit: UnitHandle,
    namespace: Arc<Namespace>,
    environment: HashMap<String, String>,
}

impl InitialContext {
    pub fn new(runtime: &Runtime) -> Result<Self> {
        Self::with_environment(runtime, HashMap::new())
    }

    pub fn with_environment(runtime: &Runtime, environment: HashMap<String, String>) -> Result<Self> {
        let unit = runtime.load(UNIT)?;
        Ok(Self {
            unit,
            namespace: Arc::clone(runtime.namespace()),
            environment,
        })
    }

    fn enter(&self, method: &str) -> Result<()> {
        self.unit
            .enter(method)
            .map_err(|source| NamingError::NoInitialContext { source })
    }

    fn split(name: &str) -> Result<(Vec<String>, String)> {
        let mut parts = NameParser.parse(name)?;
        match parts.pop() {
            Some(last) => Ok((parts, last)),
            None => Err(NamingError::InvalidName(name.to_string())),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Bound> {
        self.enter("lookup")?;
        self.resolve(name)
    }

    fn resolve(&self, name: &str) -> Result<Bound> {
        let path = NameParser.parse(name)?;
        let root = self.namespace.root.read().unwrap_or_else(PoisonError::into_inner);
        let Some((last, parent)) = path.split_last() else {
            return Ok(Bound::Context(String::new()));
        };
        let ctx = walk(&root, parent, name)?;
        match ctx.get(last) {
            Some(Node::Object(value)) => Ok(Bound::Object(value.clone())),
            Some(Node::Context(_)) => Ok(Bound::Context(name.to_string())),
            None => Err(NamingError::NameNotFound(name.to_string())),
        }
    }

    pub fn bind(&self, name: &str, value: Value) -> Result<()> {
        self.enter("bind")?;
        let (parent, last) = Self::split(name)?;
        let mut root = self.namespace.root.write().unwrap_or_else(PoisonError::into_inner);
        let ctx = walk_mut(&mut root, &parent, name)?;
        if ctx.contains_key(&last) {
            return Err(NamingError::NameAlreadyBound(name.to_string()));
        }
        ctx.insert(last, Node::Object(value));
        Ok(())
    }

    pub fn rebind(&self, name: &str, value: Value) -> Result<()> {
        self.enter("rebind")?;
        let (parent, last) = Self::split(name)?;
        let mut root = self.namespace.root.write().unwrap_or_else(PoisonError::into_inner);
        let ctx = walk_mut(&mut root, &parent, name)?;
        ctx.insert(last, Node::Object(value));
        Ok(())
    }

    /// Remove the binding for `name`. Unbinding a name that is not bound
    /// succeeds as long as its parent context exists.
    pub fn unbind(&self, name: &str) -> Result<()> {
        self.enter("unbind")?;
        let (parent, last) = Self::split(name)?;
        let mut root = self.namespace.root.write().unwrap_or_else(PoisonError::into_inner);
        let ctx = walk_mut(&mut root, &parent, name)?;
        ctx.remove(&last);
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.enter("rename")?;
        let (old_parent, old_last) = Self::split(old)?;
        let (new_parent, new_last) = Self::split(new)?;
        let mut root = self.namespace.root.write().unwrap_or_else(PoisonError::into_inner);

        if walk(&root, &new_parent, new)?.contains_key(&new_last) {
            return Err(NamingError::NameAlreadyBound(new.to_string()));
        }
        let mut moved = old_parent.clone();
        moved.push(old_last.clone());
        if new_parent.starts_with(&moved) {
            return Err(NamingError::InvalidName(new.to_string()));
        }
        let node = walk_mut(&mut root, &old_parent, old)?
            .remove(&old_last)
            .ok_or_else(|| NamingError::NameNotFound(old.to_string()))?;
        walk_mut(&mut root, &new_parent, new)?.insert(new_last, node);
        Ok(())
    }

    pub fn list(&self, name: &str) -> Result<Vec<NameClassPair>> {
        self.enter("list")?;
        let path = NameParser.parse(name)?;
        let root = self.namespace.root.read().unwrap_or_else(PoisonError::into_inner);
        let ctx = walk(&root, &path, name)?;
        Ok(ctx
            .iter()
            .map(|(name, node)| NameClassPair {
                name: name.clone(),
                class: node.class(),
            })
            .collect())
    }

    pub fn list_bindings(&self, name: &str) -> Result<Vec<(String, Bound)>> {
        self.enter("list_bindings")?;
        let path = NameParser.parse(name)?;
        let root = self.namespace.root.read().unwrap_or_else(PoisonError::into_inner);
        let ctx = walk(&root, &path, name)?;
        Ok(ctx
            .iter()
            .map(|(child, node)| {
                let bound = match node {
                    Node::Object(value) => Bound::Object(value.clone()),
                    Node::Context(_) if name.is_empty() => Bound::Context(child.clone()),
                    Node::Context(_) => Bound::Context(format!("{name}/{child}")),
                };
                (child.clone(), bound)
            })
            .collect())
    }

    pub fn create_subcontext(&self, name: &str) -> Result<()> {
        self.enter("create_subcontext")?;
        let (parent, last) = Self::split(name)?;
        let mut root = self.namespace.root.write().unwrap_or_else(PoisonError::into_inner);
        let ctx = walk_mut(&mut root, &parent, name)?;
        if ctx.contains_key(&last) {
            return Err(NamingError::NameAlreadyBound(name.to_string()));
        }
        ctx.insert(last, Node::Context(BTreeMap::new()));
        Ok(())
    }

    /// Remove an empty subcontext. Destroying an unbound name is a no-op.
    pub fn destroy_subcontext(&self, name: &str) -> Result<()> {
        self.enter("destroy_subcontext")?;
        let (parent, last) = Self::split(name)?;
        let mut root = self.namespace.root.write().unwrap_or_else(PoisonError::into_inner);
        let ctx = walk_mut(&mut root, &parent, name)?;
        match ctx.get(&last) {
            None => Ok(()),
            Some(Node::Object(_)) => Err(NamingError::NotContext(name.to_string())),
            Some(Node::Context(children)) if !children.is_empty() => {
                Err(NamingError::ContextNotEmpty(name.to_string()))
            }
            Some(Node::Context(_)) => {
                ctx.remove(&last);
                Ok(())
            }
        }
    }

    /// Like [`lookup`](Self::lookup). The namespace stores no links.
    pub fn lookup_link(&self, name: &str) -> Result<Bound> {
        self.enter("lookup_link")?;
        self.resolve(name)
    }

    pub fn get_name_parser(&self, name: &str) -> Result<NameParser> {
        self.enter("get_name_parser")?;
        let path = NameParser.parse(name)?;
        let root = self.namespace.root.read().unwrap_or_else(PoisonError::into_inner);
        walk(&root, &path, name)?;
        Ok(NameParser)
    }

    /// Returns the previous value of `key`.
    pub fn add_to_environment(&mut self, key: &str, value: &str) -> Result<Option<String>> {
        self.enter("add_to_environment")?;
        Ok(self.environment.insert(key.to_string(), value.to_string()))
    }

    pub fn remove_from_environment(&mut self, key: &str) -> Result<Option<String>> {
        self.enter("remove_from_environment")?;
        Ok(self.environment.remove(key))
    }

    pub fn get_environment(&self) -> Result<HashMap<String, String>> {
        self.enter("get_environment")?;
        Ok(self.environment.clone())
    }

    /// Full name of this context: the root, so always empty.
    pub fn get_name_in_namespace(&self) -> Result<String> {
        self.enter("get_name_in_namespace")?;
        Ok(String::new())
    }

    /// Release the context. Closing is never gated.
    pub fn close(self) -> Result<()> {
        self.enter("close")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> InitialContext {
        InitialContext::new(&Runtime::new()).unwrap()
    }

    #[test]
    fn test_bind_and_lookup() {
        let ctx = context();
        ctx.bind("greeting", json!("hello")).unwrap();
        assert_eq!(ctx.lookup("greeting").unwrap(), Bound::Object(json!("hello")));
        assert!(matches!(
            ctx.bind("greeting", json!(1)),
            Err(NamingError::NameAlreadyBound(_))
        ));
        ctx.rebind("greeting", json!("bye")).unwrap();
        assert_eq!(ctx.lookup_link("greeting").unwrap(), Bound::Object(json!("bye")));
    }

    #[test]
    fn test_subcontexts() {
        let ctx = context();
        ctx.create_subcontext("env").unwrap();
        ctx.bind("env/db", json!({"url": "jdbc:h2:mem"})).unwrap();
        assert_eq!(ctx.lookup("env").unwrap(), Bound::Context("env".into()));
        assert!(matches!(
            ctx.destroy_subcontext("env"),
            Err(NamingError::ContextNotEmpty(_))
        ));
        assert!(matches!(
            ctx.bind("env/db/x", json!(1)),
            Err(NamingError::NotContext(_))
        ));

        let listed = ctx.list("env").unwrap();
        assert_eq!(
            listed,
            vec![NameClassPair {
                name: "db".into(),
                class: "object"
            }]
        );
        let root = ctx.list_bindings("").unwrap();
        assert_eq!(root, vec![("env".to_string(), Bound::Context("env".into()))]);

        ctx.unbind("env/db").unwrap();
        ctx.unbind("env/db").unwrap();
        ctx.destroy_subcontext("env").unwrap();
        ctx.destroy_subcontext("env").unwrap();
        assert!(matches!(ctx.lookup("env"), Err(NamingError::NameNotFound(_))));
    }

    #[test]
    fn test_rename_moves_bindings() {
        let ctx = context();
        ctx.create_subcontext("a").unwrap();
        ctx.bind("a/x", json!(1)).unwrap();
        ctx.bind("y", json!(2)).unwrap();

        assert!(matches!(ctx.rename("a/x", "y"), Err(NamingError::NameAlreadyBound(_))));
        ctx.rename("a/x", "z").unwrap();
        assert_eq!(ctx.lookup("z").unwrap(), Bound::Object(json!(1)));
        assert!(matches!(ctx.lookup("a/x"), Err(NamingError::NameNotFound(_))));

        assert!(matches!(ctx.rename("a", "a/b"), Err(NamingError::InvalidName(_))));
        assert_eq!(ctx.lookup("a").unwrap(), Bound::Context("a".into()));
    }

    #[test]
    fn test_contexts_share_the_runtime_namespace() {
        let rt = Runtime::new();
        let first = InitialContext::new(&rt).unwrap();
        let second = InitialContext::new(&rt).unwrap();
        first.bind("shared", json!(true)).unwrap();
        assert_eq!(second.lookup("shared").unwrap(), Bound::Object(json!(true)));
    }

    #[test]
    fn test_environment_is_per_context() {
        let mut ctx = context();
        assert_eq!(ctx.add_to_environment("provider", "local").unwrap(), None);
        assert_eq!(
            ctx.add_to_environment("provider", "remote").unwrap().as_deref(),
            Some("local")
        );
        assert_eq!(ctx.get_environment().unwrap().len(), 1);
        assert!(ctx.remove_from_environment("provider").unwrap().is_some());
        assert!(ctx.get_environment().unwrap().is_empty());
        assert_eq!(ctx.get_name_in_namespace().unwrap(), "");
    }

    #[test]
    fn test_invalid_names() {
        let ctx = context();
        assert!(matches!(ctx.bind("", json!(1)), Err(NamingError::InvalidName(_))));
        assert!(matches!(ctx.lookup("a//b"), Err(NamingError::InvalidName(_))));
        let parser = ctx.get_name_parser("").unwrap();
        assert_eq!(parser.parse("a/b").unwrap(), vec!["a", "b"]);
    }
}
