use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{BlockedKind, Error};

/// The dangerous capability classes gated by the agent.
///
/// The set is closed: capabilities are compiled in and never change at
/// runtime. Only whether a capability is blocked varies per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Directory-naming lookups and bindings.
    Jndi,
    /// Remote object registry lookup and creation.
    Rmi,
    /// External process execution.
    Process,
    /// Embedded HTTP server provider lookup.
    HttpServer,
    /// Object stream (de)serialization.
    Serialization,
    /// Raw memory access.
    Unsafe,
}

const ALL: [Capability; 6] = [
    Capability::Jndi,
    Capability::Rmi,
    Capability::Process,
    Capability::HttpServer,
    Capability::Serialization,
    Capability::Unsafe,
];

/// All capabilities, in declaration order.
pub fn all_capabilities() -> &'static [Capability] {
    &ALL
}

impl Capability {
    /// Configuration token for this capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jndi => "jndi",
            Self::Rmi => "rmi",
            Self::Process => "process",
            Self::HttpServer => "httpserver",
            Self::Serialization => "serialization",
            Self::Unsafe => "unsafe",
        }
    }

    /// Match a configuration token. Tokens are trimmed and compared
    /// case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim();
        ALL.into_iter()
            .find(|cap| cap.as_str().eq_ignore_ascii_case(token))
    }

    /// Error kind raised when this capability is blocked.
    pub fn error_kind(&self) -> BlockedKind {
        match self {
            Self::Jndi => BlockedKind::Lookup,
            Self::Rmi => BlockedKind::Registry,
            Self::Process => BlockedKind::Execution,
            Self::HttpServer => BlockedKind::Provider,
            Self::Serialization => BlockedKind::Serialization,
            Self::Unsafe => BlockedKind::Unsafe,
        }
    }

    /// Default message carried by the blocked error.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Jndi => "JNDI context creation blocked by aegis4j",
            Self::Rmi => "RMI registry creation blocked by aegis4j",
            Self::Process => "Process execution blocked by aegis4j",
            Self::HttpServer => "HTTP server provider lookup blocked by aegis4j",
            Self::Serialization => "Java serialization blocked by aegis4j",
            Self::Unsafe => "Unsafe blocked by aegis4j",
        }
    }

    /// Operations gated by this capability, in declaration order.
    pub fn entry_points(&self) -> &'static [EntryPoint] {
        match self {
            Self::Jndi => JNDI,
            Self::Rmi => RMI,
            Self::Process => PROCESS,
            Self::HttpServer => HTTP_SERVER,
            Self::Serialization => SERIALIZATION,
            Self::Unsafe => UNSAFE,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_token(s).ok_or_else(|| Error::UnknownCapability(s.trim().to_string()))
    }
}

/// A single guarded operation: the unit that owns it and its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    pub capability: Capability,
    pub owner: &'static str,
    pub signature: &'static str,
    message: Option<&'static str>,
}

impl EntryPoint {
    const fn new(capability: Capability, owner: &'static str, signature: &'static str) -> Self {
        Self {
            capability,
            owner,
            signature,
            message: None,
        }
    }

    const fn with_message(mut self, message: &'static str) -> Self {
        self.message = Some(message);
        self
    }

    /// Message raised when this entry point is blocked.
    pub fn message(&self) -> &'static str {
        self.message.unwrap_or_else(|| self.capability.message())
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.signature)
    }
}

/// Look up the entry point declared for `owner::signature`.
///
/// `None` means the operation is not guarded.
pub fn capability_for(owner: &str, signature: &str) -> Option<&'static EntryPoint> {
    all_entry_points().find(|e| e.owner == owner && e.signature == signature)
}

/// Every entry point declared on the unit named `owner`.
pub fn entry_points_for(owner: &str) -> impl Iterator<Item = &'static EntryPoint> + '_ {
    all_entry_points().filter(move |e| e.owner == owner)
}

/// Every entry point of every capability.
pub fn all_entry_points() -> impl Iterator<Item = &'static EntryPoint> {
    ALL.iter().flat_map(|cap| cap.entry_points().iter())
}

const INITIAL_CONTEXT: &str = "naming.InitialContext";
const LOCATE_REGISTRY: &str = "registry.LocateRegistry";
const PROCESS_RUNTIME: &str = "process.ProcessRuntime";
const PROCESS_BUILDER: &str = "process.ProcessBuilder";
const HTTP_SERVER_PROVIDER: &str = "http.HttpServerProvider";
const OBJECT_INPUT_STREAM: &str = "serial.ObjectInputStream";
const OBJECT_OUTPUT_STREAM: &str = "serial.ObjectOutputStream";
const UNSAFE_MEMORY: &str = "memory.Unsafe";

const fn jndi(signature: &'static str) -> EntryPoint {
    EntryPoint::new(Capability::Jndi, INITIAL_CONTEXT, signature)
}

const fn unsafe_op(signature: &'static str) -> EntryPoint {
    EntryPoint::new(Capability::Unsafe, UNSAFE_MEMORY, signature)
}

static JNDI: &[EntryPoint] = &[
    jndi("lookup"),
    jndi("bind"),
    jndi("rebind"),
    jndi("unbind"),
    jndi("rename"),
    jndi("list"),
    jndi("list_bindings"),
    jndi("destroy_subcontext"),
    jndi("create_subcontext"),
    jndi("lookup_link"),
    jndi("get_name_parser"),
    jndi("add_to_environment"),
    jndi("remove_from_environment"),
    jndi("get_environment"),
    jndi("get_name_in_namespace"),
];

static RMI: &[EntryPoint] = &[
    EntryPoint::new(Capability::Rmi, LOCATE_REGISTRY, "get_registry"),
    EntryPoint::new(Capability::Rmi, LOCATE_REGISTRY, "get_registry_on"),
    EntryPoint::new(Capability::Rmi, LOCATE_REGISTRY, "get_registry_with"),
    EntryPoint::new(Capability::Rmi, LOCATE_REGISTRY, "create_registry"),
    EntryPoint::new(Capability::Rmi, LOCATE_REGISTRY, "create_registry_with"),
];

static PROCESS: &[EntryPoint] = &[
    EntryPoint::new(Capability::Process, PROCESS_RUNTIME, "exec"),
    EntryPoint::new(Capability::Process, PROCESS_RUNTIME, "exec_args"),
    EntryPoint::new(Capability::Process, PROCESS_RUNTIME, "exec_with"),
    EntryPoint::new(Capability::Process, PROCESS_BUILDER, "start"),
    EntryPoint::new(Capability::Process, PROCESS_BUILDER, "start_pipeline"),
];

static HTTP_SERVER: &[EntryPoint] = &[EntryPoint::new(
    Capability::HttpServer,
    HTTP_SERVER_PROVIDER,
    "provider",
)];

static SERIALIZATION: &[EntryPoint] = &[
    EntryPoint::new(Capability::Serialization, OBJECT_OUTPUT_STREAM, "new"),
    EntryPoint::new(Capability::Serialization, OBJECT_INPUT_STREAM, "new")
        .with_message("Java deserialization blocked by aegis4j"),
];

static UNSAFE: &[EntryPoint] = &[
    unsafe_op("get_unsafe"),
    unsafe_op("address_size"),
    unsafe_op("page_size"),
    unsafe_op("allocate_memory"),
    unsafe_op("reallocate_memory"),
    unsafe_op("free_memory"),
    unsafe_op("set_memory"),
    unsafe_op("copy_memory"),
    unsafe_op("get"),
    unsafe_op("put"),
    unsafe_op("get_volatile"),
    unsafe_op("put_volatile"),
    unsafe_op("put_ordered"),
    unsafe_op("get_address"),
    unsafe_op("put_address"),
    unsafe_op("compare_and_swap_int"),
    unsafe_op("compare_and_swap_long"),
    unsafe_op("get_and_add_int"),
    unsafe_op("get_and_add_long"),
    unsafe_op("get_and_set_int"),
    unsafe_op("get_and_set_long"),
    unsafe_op("array_base_offset"),
    unsafe_op("array_index_scale"),
    unsafe_op("allocate_instance"),
    unsafe_op("load_fence"),
    unsafe_op("store_fence"),
    unsafe_op("full_fence"),
    unsafe_op("park"),
    unsafe_op("unpark"),
];

/// A set of capabilities.
///
/// Backed by a bitset, so membership tests never allocate or lock.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        ALL.into_iter().collect()
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn remove(&mut self, cap: Capability) {
        self.0 &= !cap.bit();
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        ALL.into_iter().filter(|cap| self.contains(*cap))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let caps = Vec::<Capability>::deserialize(deserializer)?;
        Ok(caps.into_iter().collect())
    }
}
