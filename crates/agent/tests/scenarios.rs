//! Mixed policies: allowed capabilities behave normally, blocked ones fail.

use std::error::Error;
use std::io::Read;

use agent::Agent;
use policy::{BlockedKind, blocked_cause};
use runtime::Runtime;
use runtime::http::{HttpServer, Response};
use runtime::memory::Unsafe;
use runtime::naming::{Bound, InitialContext};
use runtime::process::ProcessRuntime;
use runtime::reflect::Instantiator;
use runtime::registry::LocateRegistry;
use runtime::serial::{ObjectInputStream, ObjectOutputStream};
use serde_json::json;

fn blocked_kind<T, E: Error + 'static>(result: Result<T, E>) -> Option<BlockedKind> {
    match result {
        Ok(_) => None,
        Err(e) => blocked_cause(&e).map(|b| b.kind()),
    }
}

#[test]
fn test_unblock_serialization_and_process() {
    let rt = Runtime::new();
    Agent::install(&rt, "unblock=serialization,process").unwrap();

    let mut out = ObjectOutputStream::new(&rt, Vec::new()).unwrap();
    out.write_object(&json!({"user": "alice"})).unwrap();
    let bytes = out.into_inner();
    let mut input = ObjectInputStream::new(&rt, bytes.as_slice()).unwrap();
    let value: serde_json::Value = input.read_object().unwrap().unwrap();
    assert_eq!(value["user"], "alice");

    #[cfg(unix)]
    {
        let mut child = ProcessRuntime::new(&rt).unwrap().exec("echo allowed").unwrap();
        let mut text = String::new();
        child.stdout.take().unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "allowed\n");
        assert!(child.wait().unwrap().success());
    }

    let ctx = InitialContext::new(&rt).unwrap();
    assert_eq!(blocked_kind(ctx.lookup("foo")), Some(BlockedKind::Lookup));
    let locate = LocateRegistry::new(&rt).unwrap();
    assert_eq!(blocked_kind(locate.create_registry(0)), Some(BlockedKind::Registry));
    assert_eq!(
        blocked_kind(HttpServer::create(&rt, "127.0.0.1:0".parse().unwrap())),
        Some(BlockedKind::Provider)
    );
    assert_eq!(blocked_kind(Unsafe::get_unsafe(&rt)), Some(BlockedKind::Unsafe));
}

#[test]
fn test_block_only_jndi() {
    let rt = Runtime::new();
    Agent::install(&rt, "block=jndi").unwrap();

    let ctx = InitialContext::new(&rt).unwrap();
    assert_eq!(blocked_kind(ctx.bind("x", json!(1))), Some(BlockedKind::Lookup));

    let locate = LocateRegistry::new(&rt).unwrap();
    let registry = locate.create_registry(0).unwrap();
    let stub = locate
        .get_registry_on("127.0.0.1", registry.local_addr().port())
        .unwrap();
    stub.bind("svc", json!("up")).unwrap();
    assert_eq!(stub.lookup("svc").unwrap(), json!("up"));
    registry.shutdown();

    let mut server = HttpServer::create(&rt, "127.0.0.1:0".parse().unwrap()).unwrap();
    server.create_context("/", |_| Response::text(200, "ok"));
    server.start().unwrap();
    server.stop();

    let u = Unsafe::get_unsafe(&rt).unwrap();
    let addr = u.allocate_memory(8).unwrap();
    unsafe {
        u.put::<u64>(addr, 42).unwrap();
        assert_eq!(u.get::<u64>(addr).unwrap(), 42);
    }
    u.free_memory(addr).unwrap();

    assert!(ObjectOutputStream::new(&rt, Vec::new()).is_ok());
}

#[test]
fn test_block_nothing() {
    let rt = Runtime::new();
    let agent = Agent::install(&rt, "block=").unwrap();
    assert!(agent.blocked().is_empty());

    let ctx = InitialContext::new(&rt).unwrap();
    ctx.create_subcontext("env").unwrap();
    ctx.bind("env/mode", json!("test")).unwrap();
    assert_eq!(ctx.lookup("env/mode").unwrap(), Bound::Object(json!("test")));
}

#[test]
fn test_instantiation_works_with_unsafe_blocked() {
    #[derive(Debug, Default, PartialEq)]
    struct Settings {
        verbose: bool,
        level: u8,
    }

    let rt = Runtime::new();
    Agent::install(&rt, "block=unsafe").unwrap();
    assert_eq!(blocked_kind(Unsafe::get_unsafe(&rt)), Some(BlockedKind::Unsafe));

    let instantiator = Instantiator::new(&rt).unwrap();
    instantiator.register::<Settings>().unwrap();
    let settings = instantiator.new_instance_of::<Settings>().unwrap();
    assert_eq!(*settings, Settings::default());
}
