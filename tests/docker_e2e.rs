//! End-to-end tests against a live Docker daemon
//! Run with: cargo test --test docker_e2e -- --ignored (requires docker and the busybox image)

use std::io::Read;

use container_reconcile::init::{HostInitAdapter, HostInitConfig};
use container_reconcile::{Action, Controller, DesiredContainerSpec, DockerEngine, EngineClient, LifecycleState};

fn controller() -> Controller<DockerEngine, HostInitAdapter> {
    let root = std::env::temp_dir().join("container-reconcile-e2e");
    Controller::new(
        DockerEngine::connect().unwrap(),
        HostInitAdapter::new(HostInitConfig::new().root(root)),
    )
}

fn spec(name: &str) -> DesiredContainerSpec {
    DesiredContainerSpec::builder()
        .image("busybox")
        .name(name)
        .command("sleep 300")
        .port("127.0.0.1:18080:80")
        .cmd_timeout(10)
        .build()
}

#[test]
#[ignore] // Run manually: cargo test --test docker_e2e -- --ignored
fn test_run_stop_remove() {
    let c = controller();
    let spec = spec("reconcile-e2e-lifecycle");

    let run = c.reconcile(Action::Run, &spec).unwrap();
    println!("Started {:?}", run.container_id);
    assert_eq!(run.state, LifecycleState::Running);

    let again = c.reconcile(Action::Run, &spec).unwrap();
    assert!(!again.updated);

    let observed = c.engine().get(run.container_id.as_deref().unwrap()).unwrap();
    assert_eq!(observed.name, "reconcile-e2e-lifecycle");
    assert!(observed.running);

    assert!(c.reconcile(Action::Stop, &spec).unwrap().updated);
    let removed = c.reconcile(Action::Remove, &spec).unwrap();
    assert_eq!(removed.state, LifecycleState::Absent);
}

#[test]
#[ignore]
fn test_redeploy_replaces_container() {
    let c = controller();
    let spec = spec("reconcile-e2e-redeploy");

    let first = c.reconcile(Action::Run, &spec).unwrap();
    let second = c.reconcile(Action::Redeploy, &spec).unwrap();
    assert_ne!(first.container_id, second.container_id);

    c.reconcile(Action::Remove, &spec).unwrap();
}

#[test]
#[ignore]
fn test_cp_streams_tar() {
    let c = controller();
    let dir = tempfile::tempdir().unwrap();
    let mut spec = spec("reconcile-e2e-cp");
    spec.source = Some("/etc/hostname".into());
    spec.destination = Some(dir.path().join("hostname.tar"));

    c.reconcile(Action::Run, &spec).unwrap();
    c.reconcile(Action::Cp, &spec).unwrap();

    let mut tar = Vec::new();
    std::fs::File::open(dir.path().join("hostname.tar"))
        .unwrap()
        .read_to_end(&mut tar)
        .unwrap();
    assert!(!tar.is_empty());

    c.reconcile(Action::Remove, &spec).unwrap();
}
