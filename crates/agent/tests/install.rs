//! Installation lifecycle against hosts with different capabilities.

use std::sync::Arc;
use std::thread;

use agent::{AGENT_NAME, Agent, InstallError};
use policy::{BlockedKind, all_entry_points, blocked_cause};
use runtime::naming::{self, InitialContext};
use runtime::process::{self, ProcessRuntime};
use runtime::{AgentState, Runtime};

fn guard_count(rt: &Runtime, unit: &str, method: &str) -> usize {
    let handle = rt.load(unit).unwrap();
    handle.active().find(method).unwrap().prologue().len()
}

#[test]
fn test_double_install_is_rejected() {
    let rt = Runtime::new();
    Agent::install(&rt, "block=jndi").unwrap();
    assert_eq!(rt.agent_state(AGENT_NAME), AgentState::Installed);

    let err = Agent::install(&rt, "unblock=jndi").unwrap_err();
    assert!(matches!(err, InstallError::AlreadyInstalled));
    assert_eq!(guard_count(&rt, naming::UNIT, "lookup"), 1);

    // The first policy stays in force.
    let ctx = InitialContext::new(&rt).unwrap();
    assert!(ctx.lookup("x").is_err());
}

#[test]
fn test_retransform_does_not_stack_guards() {
    let rt = Runtime::new();
    Agent::install(&rt, "").unwrap();
    assert_eq!(guard_count(&rt, process::BUILDER_UNIT, "start"), 1);

    rt.retransform(&[process::BUILDER_UNIT, naming::UNIT]).unwrap();
    rt.retransform(&[process::BUILDER_UNIT]).unwrap();
    assert_eq!(guard_count(&rt, process::BUILDER_UNIT, "start"), 1);
    assert_eq!(guard_count(&rt, naming::UNIT, "lookup"), 1);
}

#[test]
fn test_units_loaded_before_install_are_guarded() {
    let rt = Runtime::new();
    let ctx = InitialContext::new(&rt).unwrap();
    ctx.bind("early", serde_json::json!(1)).unwrap();

    let agent = Agent::install(&rt, "block=jndi").unwrap();
    assert_eq!(agent.retransformed(), [naming::UNIT.to_string()]);

    let err = ctx.lookup("early").unwrap_err();
    assert_eq!(blocked_cause(&err).unwrap().kind(), BlockedKind::Lookup);
}

#[test]
fn test_host_without_transformation_fails_loudly() {
    let rt = Runtime::builder().transform(false).build();
    let err = Agent::install(&rt, "").unwrap_err();
    assert!(matches!(
        err,
        InstallError::Registration(runtime::Error::Unsupported(_))
    ));
    assert_eq!(rt.agent_state(AGENT_NAME), AgentState::Failed);
    assert!(matches!(
        Agent::install(&rt, ""),
        Err(InstallError::PreviouslyFailed)
    ));
}

#[test]
fn test_host_without_retransformation() {
    // Nothing guarded is loaded yet: installation works.
    let rt = Runtime::builder().retransform(false).build();
    Agent::install(&rt, "").unwrap();
    assert!(ProcessRuntime::new(&rt).unwrap().exec("true").is_err());

    // A guarded unit is already live and cannot be rewritten.
    let rt = Runtime::builder().retransform(false).build();
    ProcessRuntime::new(&rt).unwrap();
    let err = Agent::install(&rt, "block=jndi").unwrap_err();
    assert!(matches!(err, InstallError::Retransform(_)));
    assert_eq!(rt.agent_state(AGENT_NAME), AgentState::Failed);

    // Nothing from the failed install stays registered.
    let ctx = InitialContext::new(&rt).unwrap();
    assert!(matches!(ctx.lookup("x"), Err(naming::NamingError::NameNotFound(_))));
    assert_eq!(guard_count(&rt, naming::UNIT, "lookup"), 0);

    let err = Agent::install(&rt, "block=jndi").unwrap_err();
    assert!(matches!(err, InstallError::PreviouslyFailed));
    assert_eq!(rt.agent_state(AGENT_NAME), AgentState::Failed);
}

#[test]
fn test_concurrent_first_use_is_guarded_once() {
    let rt = Arc::new(Runtime::new());
    Agent::install(&rt, "block=process").unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let rt = Arc::clone(&rt);
            thread::spawn(move || {
                let err = ProcessRuntime::new(&rt).unwrap().exec("true").unwrap_err();
                blocked_cause(&err).map(|b| b.kind())
            })
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), Some(BlockedKind::Execution));
    }
    assert_eq!(guard_count(&rt, process::RUNTIME_UNIT, "exec"), 1);
}

#[test]
fn test_entry_points_match_host_units() {
    let rt = Runtime::new();
    for entry in all_entry_points() {
        let unit = rt
            .definition(entry.owner)
            .unwrap_or_else(|| panic!("{} is not a host unit", entry.owner));
        assert!(unit.find(entry.signature).is_some(), "{entry} not declared");
    }
}

#[test]
fn test_excluded_units_are_never_rewritten() {
    let rt = Runtime::new();
    rt.define(runtime::CodeUnit::new("aegis.Support").method("lookup"))
        .unwrap();
    Agent::install(&rt, "").unwrap();
    assert_eq!(guard_count(&rt, "aegis.Support", "lookup"), 0);
    assert_eq!(guard_count(&rt, runtime::reflect::UNIT, "new_instance"), 0);
}
