//! Lifecycle controller
//!
//! One call to [`Controller::reconcile`] is one pass: validate the
//! declaration, scan the engine for the matching container, then run the requested
//! action only if its precondition holds. The declaration is never mutated; what the
//! pass did is returned as an [`ActionOutcome`].

use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::DesiredContainerSpec;
use crate::container::{LifecycleState, ResolvedContainer};
use crate::engine::{CommitOptions, CreateOptions, EngineClient, EngineResult, StartOptions};
use crate::error::EngineError;
use crate::init::{InitSystemAdapter, ServiceAction, ServiceUnit};
use crate::matcher;
use crate::{Error, Result};

/// Actions a pass can converge towards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Run,
    Start,
    Stop,
    Kill,
    Restart,
    Remove,
    Redeploy,
    Wait,
    Commit,
    Export,
    Cp,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::Run,
        Action::Start,
        Action::Stop,
        Action::Kill,
        Action::Restart,
        Action::Remove,
        Action::Redeploy,
        Action::Wait,
        Action::Commit,
        Action::Export,
        Action::Cp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Kill => "kill",
            Action::Restart => "restart",
            Action::Remove => "remove",
            Action::Redeploy => "redeploy",
            Action::Wait => "wait",
            Action::Commit => "commit",
            Action::Export => "export",
            Action::Cp => "cp",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown action '{}'", s)))
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: Action,
    /// False when the precondition already held and nothing ran
    pub updated: bool,
    pub container_id: Option<String>,
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Image created by `commit`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl ActionOutcome {
    fn unchanged(action: Action, resolved: &ResolvedContainer) -> Self {
        Self {
            action,
            updated: false,
            container_id: resolved.id().map(str::to_string),
            state: resolved.state(),
            exit_code: None,
            image_id: None,
        }
    }

    fn changed(action: Action, container_id: Option<String>, state: LifecycleState) -> Self {
        Self {
            action,
            updated: true,
            container_id,
            state,
            exit_code: None,
            image_id: None,
        }
    }
}

fn call<T>(action: &str, id: &str, result: EngineResult<T>) -> Result<T> {
    result.map_err(|e| Error::engine_call(action, id, e))
}

/// Converges one declared container per pass
///
/// Holds no state between passes, so one controller can serve concurrent
/// passes for different containers. Passes for the same container must be
/// serialized by the caller.
pub struct Controller<E: EngineClient, A: InitSystemAdapter> {
    engine: E,
    init: A,
}

impl<E: EngineClient, A: InitSystemAdapter> Controller<E, A> {
    pub fn new(engine: E, init: A) -> Self {
        Self { engine, init }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn init_system(&self) -> &A {
        &self.init
    }

    /// Run one reconciliation pass of `action` against `spec`
    pub fn reconcile(&self, action: Action, spec: &DesiredContainerSpec) -> Result<ActionOutcome> {
        spec.validate()?;

        let pass = uuid::Uuid::new_v4();
        let span = tracing::info_span!("reconcile", pass = %pass, action = %action, image = %spec.image);
        let _enter = span.enter();

        let resolved = matcher::scan(&self.engine, spec)?;
        tracing::debug!(state = %resolved.state(), container = ?resolved.id(), "Resolved container");

        let unit = ServiceUnit::from_spec(spec);

        let outcome = match action {
            Action::Run => self.run(spec, &resolved, unit.as_ref()),
            Action::Start => self.start(Action::Start, spec, &resolved, unit.as_ref()),
            Action::Stop => self.stop(spec, &resolved, unit.as_ref()),
            Action::Kill => self.kill(&resolved, unit.as_ref()),
            Action::Restart => self.restart(&resolved, unit.as_ref()),
            Action::Remove => self.remove(spec, &resolved, unit.as_ref()),
            Action::Redeploy => self.redeploy(spec, &resolved, unit.as_ref()),
            Action::Wait => self.wait(&resolved),
            Action::Commit => self.commit(spec, &resolved),
            Action::Export => self.export(spec, &resolved),
            Action::Cp => self.cp(spec, &resolved),
        }?;

        if outcome.updated {
            tracing::info!(container = ?outcome.container_id, state = %outcome.state, "Action applied");
        } else {
            tracing::info!(container = ?outcome.container_id, state = %outcome.state, "Already converged, nothing to do");
        }
        Ok(outcome)
    }

    fn run(
        &self,
        spec: &DesiredContainerSpec,
        resolved: &ResolvedContainer,
        unit: Option<&ServiceUnit>,
    ) -> Result<ActionOutcome> {
        match resolved.state() {
            LifecycleState::Running => Ok(ActionOutcome::unchanged(Action::Run, resolved)),
            LifecycleState::Ghost => Ok(skip_ghost(Action::Run, resolved)),
            LifecycleState::Stopped => self.start(Action::Run, spec, resolved, unit),
            LifecycleState::Absent => self.create_and_start(spec, unit),
        }
    }

    fn create_and_start(&self, spec: &DesiredContainerSpec, unit: Option<&ServiceUnit>) -> Result<ActionOutcome> {
        let ports = spec.port_map()?;
        let volumes = spec.volume_set()?;
        let options = CreateOptions::from_spec(spec, &ports, &volumes);

        let id = call("create", "", self.engine.create(&options))?;
        tracing::info!(container = %id, name = ?options.name, "Created container");

        call("start", &id, self.engine.start(&id, &options.host_config))?;
        tracing::info!(container = %id, "Started container");

        if let Some(unit) = unit {
            self.init.create(unit)?;
            self.init.action(unit, ServiceAction::Start)?;
            self.init.action(unit, ServiceAction::Enable)?;
            tracing::info!(container = %id, service = %unit.name, init = %unit.init, "Installed service unit");
        }

        Ok(ActionOutcome::changed(Action::Run, Some(id), LifecycleState::Running))
    }

    fn start(
        &self,
        action: Action,
        spec: &DesiredContainerSpec,
        resolved: &ResolvedContainer,
        unit: Option<&ServiceUnit>,
    ) -> Result<ActionOutcome> {
        let id = match (resolved.state(), resolved.id()) {
            (LifecycleState::Running, _) => return Ok(ActionOutcome::unchanged(action, resolved)),
            (LifecycleState::Ghost, _) => return Ok(skip_ghost(action, resolved)),
            (_, Some(id)) => id,
            (_, None) => {
                return Err(Error::engine_call(
                    action.as_str(),
                    "",
                    EngineError::NotFound(format!("no container matches image '{}'", spec.image)),
                ))
            }
        };

        match unit {
            Some(unit) => {
                self.init.create(unit)?;
                self.init.action(unit, ServiceAction::Start)?;
                self.init.action(unit, ServiceAction::Enable)?;
            }
            None => {
                let ports = spec.port_map()?;
                call("start", id, self.engine.start(id, &StartOptions::from_spec(spec, &ports)))?;
            }
        }

        Ok(ActionOutcome::changed(action, Some(id.to_string()), LifecycleState::Running))
    }

    /// Engine stop or supervisor stop, whichever owns the container
    fn stop_running(&self, spec: &DesiredContainerSpec, id: &str, unit: Option<&ServiceUnit>) -> Result<()> {
        match unit {
            Some(unit) => self.init.action(unit, ServiceAction::Stop),
            None => call("stop", id, self.engine.stop(id, spec.command_timeout())),
        }
    }

    fn stop(
        &self,
        spec: &DesiredContainerSpec,
        resolved: &ResolvedContainer,
        unit: Option<&ServiceUnit>,
    ) -> Result<ActionOutcome> {
        let Some(id) = resolved.id().filter(|_| resolved.is_running()) else {
            return Ok(ActionOutcome::unchanged(Action::Stop, resolved));
        };

        self.stop_running(spec, id, unit)?;
        Ok(ActionOutcome::changed(Action::Stop, Some(id.to_string()), LifecycleState::Stopped))
    }

    fn kill(&self, resolved: &ResolvedContainer, unit: Option<&ServiceUnit>) -> Result<ActionOutcome> {
        let Some(id) = resolved.id() else {
            return Ok(ActionOutcome::unchanged(Action::Kill, resolved));
        };

        match (resolved.state(), unit) {
            (LifecycleState::Running, Some(unit)) => self.init.action(unit, ServiceAction::Stop)?,
            (LifecycleState::Running | LifecycleState::Ghost, _) => call("kill", id, self.engine.kill(id))?,
            _ => return Ok(ActionOutcome::unchanged(Action::Kill, resolved)),
        }

        Ok(ActionOutcome::changed(Action::Kill, Some(id.to_string()), LifecycleState::Stopped))
    }

    fn restart(&self, resolved: &ResolvedContainer, unit: Option<&ServiceUnit>) -> Result<ActionOutcome> {
        let id = match (resolved.state(), resolved.id()) {
            (LifecycleState::Ghost, _) => return Ok(skip_ghost(Action::Restart, resolved)),
            (_, Some(id)) => id,
            (_, None) => return Ok(ActionOutcome::unchanged(Action::Restart, resolved)),
        };

        match unit {
            Some(unit) => self.init.action(unit, ServiceAction::Restart)?,
            None => call("restart", id, self.engine.restart(id))?,
        }

        Ok(ActionOutcome::changed(Action::Restart, Some(id.to_string()), LifecycleState::Running))
    }

    fn remove(
        &self,
        spec: &DesiredContainerSpec,
        resolved: &ResolvedContainer,
        unit: Option<&ServiceUnit>,
    ) -> Result<ActionOutcome> {
        let Some(id) = resolved.id() else {
            return Ok(ActionOutcome::unchanged(Action::Remove, resolved));
        };

        self.remove_existing(spec, resolved, id, unit)?;
        Ok(ActionOutcome::changed(Action::Remove, Some(id.to_string()), LifecycleState::Absent))
    }

    fn remove_existing(
        &self,
        spec: &DesiredContainerSpec,
        resolved: &ResolvedContainer,
        id: &str,
        unit: Option<&ServiceUnit>,
    ) -> Result<()> {
        if resolved.is_running() {
            self.stop_running(spec, id, unit)?;
            tracing::info!(container = %id, "Stopped container before removal");
        }

        call("delete", id, self.engine.delete(id))?;
        tracing::info!(container = %id, "Deleted container");

        if let Some(unit) = unit {
            self.init.remove(unit)?;
            tracing::info!(service = %unit.name, init = %unit.init, "Removed service unit");
        }
        Ok(())
    }

    fn redeploy(
        &self,
        spec: &DesiredContainerSpec,
        resolved: &ResolvedContainer,
        unit: Option<&ServiceUnit>,
    ) -> Result<ActionOutcome> {
        if let Some(id) = resolved.id() {
            self.remove_existing(spec, resolved, id, unit)?;
        }

        let outcome = self.create_and_start(spec, unit)?;
        Ok(ActionOutcome {
            action: Action::Redeploy,
            ..outcome
        })
    }

    fn wait(&self, resolved: &ResolvedContainer) -> Result<ActionOutcome> {
        let Some(id) = resolved.id().filter(|_| resolved.is_running()) else {
            return Ok(ActionOutcome::unchanged(Action::Wait, resolved));
        };

        let code = call("wait", id, self.engine.wait(id))?;
        tracing::info!(container = %id, exit_code = code, "Container exited");

        Ok(ActionOutcome {
            exit_code: Some(code),
            ..ActionOutcome::changed(Action::Wait, Some(id.to_string()), LifecycleState::Stopped)
        })
    }

    fn commit(&self, spec: &DesiredContainerSpec, resolved: &ResolvedContainer) -> Result<ActionOutcome> {
        let Some(id) = existing_id(Action::Commit, resolved) else {
            return Ok(skip_unless_absent(Action::Commit, resolved));
        };

        let options = CommitOptions::from(&spec.commit);
        let image_id = call("commit", id, self.engine.commit(id, &options))?;
        tracing::info!(container = %id, image = %image_id, reference = ?options.reference(), "Committed container");

        Ok(ActionOutcome {
            image_id: Some(image_id),
            ..ActionOutcome::changed(Action::Commit, Some(id.to_string()), resolved.state())
        })
    }

    fn export(&self, spec: &DesiredContainerSpec, resolved: &ResolvedContainer) -> Result<ActionOutcome> {
        let destination = destination(spec)?;
        let Some(id) = existing_id(Action::Export, resolved) else {
            return Ok(skip_unless_absent(Action::Export, resolved));
        };

        let stream = call("export", id, self.engine.export(id))?;
        let bytes = write_stream("export", id, stream, destination)?;
        tracing::info!(container = %id, destination = %destination.display(), bytes, "Exported container");

        Ok(ActionOutcome::changed(Action::Export, Some(id.to_string()), resolved.state()))
    }

    fn cp(&self, spec: &DesiredContainerSpec, resolved: &ResolvedContainer) -> Result<ActionOutcome> {
        let destination = destination(spec)?;
        let source = spec
            .source
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidSpec("cp needs a source path".into()))?;
        let Some(id) = existing_id(Action::Cp, resolved) else {
            return Ok(skip_unless_absent(Action::Cp, resolved));
        };

        let stream = call("copy", id, self.engine.copy(id, source))?;
        let bytes = write_stream("copy", id, stream, destination)?;
        tracing::info!(container = %id, source, destination = %destination.display(), bytes, "Copied out of container");

        Ok(ActionOutcome::changed(Action::Cp, Some(id.to_string()), resolved.state()))
    }
}

/// ID of a stopped or running container; ghosts and absent containers give `None`
fn existing_id(action: Action, resolved: &ResolvedContainer) -> Option<&str> {
    match resolved.state() {
        LifecycleState::Running | LifecycleState::Stopped => resolved.id(),
        LifecycleState::Ghost | LifecycleState::Absent => {
            tracing::debug!(action = %action, state = %resolved.state(), "No usable container");
            None
        }
    }
}

fn skip_unless_absent(action: Action, resolved: &ResolvedContainer) -> ActionOutcome {
    if resolved.state() == LifecycleState::Ghost {
        skip_ghost(action, resolved)
    } else {
        ActionOutcome::unchanged(action, resolved)
    }
}

fn skip_ghost(action: Action, resolved: &ResolvedContainer) -> ActionOutcome {
    tracing::warn!(
        container = ?resolved.id(),
        action = %action,
        "Container is a ghost, only kill, remove and redeploy act on it"
    );
    ActionOutcome::unchanged(action, resolved)
}

fn destination(spec: &DesiredContainerSpec) -> Result<&Path> {
    spec.destination
        .as_deref()
        .ok_or_else(|| Error::InvalidSpec("a destination file is required".into()))
}

/// Fill a temporary file beside `destination`, then move it into place. A
/// stream that fails part way leaves the destination untouched.
fn write_stream(action: &str, id: &str, mut stream: Box<dyn Read + Send>, destination: &Path) -> Result<u64> {
    let dir = destination
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir)?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::engine_call(action, id, EngineError::Io(e))),
        };
        file.write_all(&buf[..n])?;
        written += n as u64;
    }

    file.persist(destination).map_err(|e| e.error)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitSystem;
    use crate::container::ObservedContainer;
    use crate::engine::MockEngineClient;
    use crate::init::MockInitSystemAdapter;
    use mockall::Sequence;
    use std::io::Cursor;

    /// Hands out a few bytes, then fails like a daemon dropping the transfer
    struct TruncatedStream {
        sent: bool,
    }

    impl Read for TruncatedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::other("unexpected EOF in tar body"));
            }
            self.sent = true;
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&b"part"[..n]);
            Ok(n)
        }
    }

    fn container(id: &str, running: bool, ghost: bool) -> ObservedContainer {
        ObservedContainer {
            id: id.into(),
            image_id: "sha256:abc".into(),
            image_name: "registry/app:1.0".into(),
            command: "serve".into(),
            name: "web".into(),
            created: None,
            running,
            ghost,
        }
    }

    /// Engine mock whose scan sees exactly `observed`
    fn engine_with(observed: Vec<ObservedContainer>) -> MockEngineClient {
        let mut engine = MockEngineClient::new();
        let ids: Vec<String> = observed.iter().map(|c| c.id.clone()).collect();
        engine.expect_list_all().returning(move || Ok(ids.clone()));
        engine.expect_get().returning(move |id| {
            observed
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(id.to_string()))
        });
        engine
    }

    fn spec() -> DesiredContainerSpec {
        DesiredContainerSpec::builder().image("app:1.0").name("web").build()
    }

    fn service_spec() -> DesiredContainerSpec {
        DesiredContainerSpec::builder()
            .image("app:1.0")
            .name("web")
            .init_system(InitSystem::Systemd { template: None, socket_template: None })
            .build()
    }

    fn controller(engine: MockEngineClient) -> Controller<MockEngineClient, MockInitSystemAdapter> {
        Controller::new(engine, MockInitSystemAdapter::new())
    }

    #[test]
    fn test_action_parse_and_display() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert_eq!(Action::Cp.to_string(), "cp");
        assert!(matches!("deploy".parse::<Action>(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_scenario_run_is_noop_and_stop_proceeds() {
        let c = controller(engine_with(vec![container("c1", true, false)]));
        let outcome = c.reconcile(Action::Run, &spec()).unwrap();
        assert!(!outcome.updated);
        assert_eq!(outcome.state, LifecycleState::Running);

        let mut engine = engine_with(vec![container("c1", true, false)]);
        engine
            .expect_stop()
            .withf(|id, timeout| id == "c1" && timeout.as_secs() == 60)
            .times(1)
            .returning(|_, _| Ok(()));
        let outcome = controller(engine).reconcile(Action::Stop, &spec()).unwrap();
        assert!(outcome.updated);
        assert_eq!(outcome.state, LifecycleState::Stopped);
    }

    #[test]
    fn test_start_on_running_is_noop() {
        let mut engine = engine_with(vec![container("c1", true, false)]);
        engine.expect_start().never();
        let outcome = controller(engine).reconcile(Action::Start, &spec()).unwrap();
        assert!(!outcome.updated);
        assert_eq!(outcome.container_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_start_stopped_uses_start_options() {
        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine
            .expect_start()
            .withf(|id, opts| id == "c1" && opts.port_bindings.contains_key("80/tcp"))
            .times(1)
            .returning(|_, _| Ok(()));

        let spec = DesiredContainerSpec::builder().image("app:1.0").name("web").port("8080:80").build();
        let outcome = controller(engine).reconcile(Action::Start, &spec).unwrap();
        assert_eq!(outcome.state, LifecycleState::Running);
    }

    #[test]
    fn test_start_absent_is_engine_call_failed() {
        let err = controller(engine_with(vec![])).reconcile(Action::Start, &spec()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_run_absent_creates_then_starts() {
        let mut engine = engine_with(vec![]);
        let mut seq = Sequence::new();
        engine
            .expect_create()
            .withf(|opts| opts.image == "app:1.0" && opts.name.as_deref() == Some("web"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("new1".to_string()));
        engine
            .expect_start()
            .withf(|id, _| id == "new1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let outcome = controller(engine).reconcile(Action::Run, &spec()).unwrap();
        assert!(outcome.updated);
        assert_eq!(outcome.container_id.as_deref(), Some("new1"));
        assert_eq!(outcome.state, LifecycleState::Running);
    }

    #[test]
    fn test_run_stopped_delegates_to_start() {
        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine.expect_create().never();
        engine.expect_start().times(1).returning(|_, _| Ok(()));

        let outcome = controller(engine).reconcile(Action::Run, &spec()).unwrap();
        assert_eq!(outcome.action, Action::Run);
        assert_eq!(outcome.container_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_run_in_service_mode_installs_unit() {
        let mut engine = engine_with(vec![]);
        engine.expect_create().returning(|_| Ok("new1".to_string()));
        engine.expect_start().returning(|_, _| Ok(()));

        let mut init = MockInitSystemAdapter::new();
        let mut seq = Sequence::new();
        init.expect_create()
            .withf(|unit| unit.name == "web")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        init.expect_action()
            .withf(|_, action| *action == ServiceAction::Start)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        init.expect_action()
            .withf(|_, action| *action == ServiceAction::Enable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let outcome = Controller::new(engine, init).reconcile(Action::Run, &service_spec()).unwrap();
        assert!(outcome.updated);
    }

    #[test]
    fn test_start_in_service_mode_routes_to_adapter() {
        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine.expect_start().never();

        let mut init = MockInitSystemAdapter::new();
        let mut seq = Sequence::new();
        init.expect_create().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        init.expect_action()
            .withf(|_, action| *action == ServiceAction::Start)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        init.expect_action()
            .withf(|_, action| *action == ServiceAction::Enable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        Controller::new(engine, init).reconcile(Action::Start, &service_spec()).unwrap();
    }

    #[test]
    fn test_remove_running_stops_then_deletes() {
        let mut engine = engine_with(vec![container("c1", true, false)]);
        let mut seq = Sequence::new();
        engine
            .expect_stop()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        engine
            .expect_delete()
            .withf(|id| id == "c1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let outcome = controller(engine).reconcile(Action::Remove, &spec()).unwrap();
        assert_eq!(outcome.state, LifecycleState::Absent);
    }

    #[test]
    fn test_remove_in_service_mode_removes_unit() {
        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine.expect_delete().times(1).returning(|_| Ok(()));

        let mut init = MockInitSystemAdapter::new();
        init.expect_remove().withf(|unit| unit.name == "web").times(1).returning(|_| Ok(()));

        Controller::new(engine, init).reconcile(Action::Remove, &service_spec()).unwrap();
    }

    #[test]
    fn test_redeploy_absent_only_runs() {
        let mut engine = engine_with(vec![]);
        engine.expect_stop().never();
        engine.expect_delete().never();
        engine.expect_create().times(1).returning(|_| Ok("new1".to_string()));
        engine.expect_start().times(1).returning(|_, _| Ok(()));

        let outcome = controller(engine).reconcile(Action::Redeploy, &spec()).unwrap();
        assert_eq!(outcome.action, Action::Redeploy);
        assert_eq!(outcome.container_id.as_deref(), Some("new1"));
    }

    #[test]
    fn test_redeploy_running_stops_removes_runs() {
        let mut engine = engine_with(vec![container("c1", true, false)]);
        let mut seq = Sequence::new();
        engine.expect_stop().times(1).in_sequence(&mut seq).returning(|_, _| Ok(()));
        engine.expect_delete().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        engine.expect_create().times(1).in_sequence(&mut seq).returning(|_| Ok("new1".to_string()));
        engine.expect_start().times(1).in_sequence(&mut seq).returning(|_, _| Ok(()));

        controller(engine).reconcile(Action::Redeploy, &spec()).unwrap();
    }

    #[test]
    fn test_redeploy_remove_failure_skips_run() {
        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine
            .expect_delete()
            .returning(|id| Err(EngineError::Conflict(format!("{} is busy", id))));
        engine.expect_create().never();

        let err = controller(engine).reconcile(Action::Redeploy, &spec()).unwrap_err();
        assert!(matches!(err, Error::EngineCallFailed { ref action, ref container_id, .. }
            if action == "delete" && container_id == "c1"));
    }

    #[test]
    fn test_ghost_only_kill_and_remove_act() {
        let ghost = || engine_with(vec![container("g1", true, true)]);

        for action in [Action::Run, Action::Start, Action::Stop, Action::Restart, Action::Wait, Action::Commit] {
            let outcome = controller(ghost()).reconcile(action, &spec()).unwrap();
            assert!(!outcome.updated, "{action} acted on a ghost");
            assert_eq!(outcome.state, LifecycleState::Ghost);
        }

        let mut engine = ghost();
        engine.expect_kill().times(1).returning(|_| Ok(()));
        assert!(controller(engine).reconcile(Action::Kill, &spec()).unwrap().updated);

        let mut engine = ghost();
        engine.expect_stop().never();
        engine.expect_delete().times(1).returning(|_| Ok(()));
        assert!(controller(engine).reconcile(Action::Remove, &spec()).unwrap().updated);
    }

    #[test]
    fn test_kill_stopped_is_noop() {
        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine.expect_kill().never();
        assert!(!controller(engine).reconcile(Action::Kill, &spec()).unwrap().updated);
    }

    #[test]
    fn test_restart_requires_existence() {
        let mut engine = engine_with(vec![]);
        engine.expect_restart().never();
        assert!(!controller(engine).reconcile(Action::Restart, &spec()).unwrap().updated);

        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine.expect_restart().times(1).returning(|_| Ok(()));
        let outcome = controller(engine).reconcile(Action::Restart, &spec()).unwrap();
        assert_eq!(outcome.state, LifecycleState::Running);
    }

    #[test]
    fn test_wait_reports_exit_code() {
        let mut engine = engine_with(vec![container("c1", true, false)]);
        engine.expect_wait().times(1).returning(|_| Ok(137));
        let outcome = controller(engine).reconcile(Action::Wait, &spec()).unwrap();
        assert_eq!(outcome.exit_code, Some(137));
        assert_eq!(outcome.state, LifecycleState::Stopped);
    }

    #[test]
    fn test_commit_returns_image_id() {
        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine
            .expect_commit()
            .withf(|_, opts| opts.repo.as_deref() == Some("acme/web"))
            .returning(|_, _| Ok("sha256:fff".to_string()));

        let mut spec = spec();
        spec.commit.repo = Some("acme/web".into());
        let outcome = controller(engine).reconcile(Action::Commit, &spec).unwrap();
        assert_eq!(outcome.image_id.as_deref(), Some("sha256:fff"));
        assert_eq!(outcome.state, LifecycleState::Stopped);
    }

    #[test]
    fn test_cp_writes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("conf.tar");

        let mut engine = engine_with(vec![container("c1", true, false)]);
        engine
            .expect_copy()
            .withf(|id, path| id == "c1" && path == "/etc/app.conf")
            .returning(|_, _| Ok(Box::new(Cursor::new(b"tar bytes".to_vec())) as Box<dyn Read + Send>));

        let spec = DesiredContainerSpec::builder()
            .image("app:1.0")
            .name("web")
            .source("/etc/app.conf")
            .destination(&dest)
            .build();
        controller(engine).reconcile(Action::Cp, &spec).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"tar bytes");
    }

    #[test]
    fn test_cp_failing_stream_is_engine_call_failed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("conf.tar");

        let mut engine = engine_with(vec![container("c1", true, false)]);
        engine
            .expect_copy()
            .returning(|_, _| Ok(Box::new(TruncatedStream { sent: false }) as Box<dyn Read + Send>));

        let spec = DesiredContainerSpec::builder()
            .image("app:1.0")
            .name("web")
            .source("/etc/app.conf")
            .destination(&dest)
            .build();
        let err = controller(engine).reconcile(Action::Cp, &spec).unwrap_err();

        match err {
            Error::EngineCallFailed { action, container_id, source } => {
                assert_eq!(action, "copy");
                assert_eq!(container_id, "c1");
                assert!(matches!(source, EngineError::Io(_)));
            }
            other => panic!("expected EngineCallFailed, got {other:?}"),
        }
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_export_failure_keeps_previous_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("rootfs.tar");
        std::fs::write(&dest, b"previous export").unwrap();

        let mut engine = engine_with(vec![container("c1", false, false)]);
        engine
            .expect_export()
            .returning(|_| Ok(Box::new(TruncatedStream { sent: false }) as Box<dyn Read + Send>));

        let spec = DesiredContainerSpec::builder()
            .image("app:1.0")
            .name("web")
            .destination(&dest)
            .build();
        let err = controller(engine).reconcile(Action::Export, &spec).unwrap_err();

        assert!(matches!(err, Error::EngineCallFailed { ref action, .. } if action == "export"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous export");
    }

    #[test]
    fn test_export_without_destination_is_invalid() {
        let err = controller(engine_with(vec![container("c1", true, false)]))
            .reconcile(Action::Export, &spec())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn test_invalid_spec_never_reaches_engine() {
        let mut engine = MockEngineClient::new();
        engine.expect_list_all().never();
        let spec = DesiredContainerSpec::builder().image("app").port("a:b:c:d").build();
        assert!(matches!(
            controller(engine).reconcile(Action::Run, &spec),
            Err(Error::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_outcome_serializes_lowercase() {
        let outcome = ActionOutcome::changed(Action::Redeploy, Some("c1".into()), LifecycleState::Running);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["action"], "redeploy");
        assert_eq!(json["updated"], true);
        assert!(json.get("exit_code").is_none());
    }
}
