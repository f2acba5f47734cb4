//! Init system adapter for the local host
//!
//! Unit files are written under a configurable root (`/` in production) and
//! the supervisor is driven through its own command line tools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::unit;
use super::{InitSystemAdapter, ServiceAction, ServiceUnit};
use crate::command::{Invocation, Runner, SystemRunner};
use crate::config::InitSystem;
use crate::error::CommandError;
use crate::{Error, Result};

/// Where unit files live and how long supervisor commands may take
#[derive(Debug, Clone)]
pub struct HostInitConfig {
    pub root: PathBuf,
    pub timeout: Duration,
}

impl Default for HostInitConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            timeout: Duration::from_secs(crate::config::DEFAULT_CMD_TIMEOUT_SECS),
        }
    }
}

impl HostInitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A unit file to install
struct UnitFile {
    path: PathBuf,
    template: String,
    mode: u32,
}

/// Drives systemd, upstart, sysv or runit on this host
pub struct HostInitAdapter<R: Runner = SystemRunner> {
    config: HostInitConfig,
    runner: R,
}

impl HostInitAdapter<SystemRunner> {
    pub fn new(config: HostInitConfig) -> Self {
        Self::with_runner(config, SystemRunner)
    }
}

impl<R: Runner> HostInitAdapter<R> {
    pub fn with_runner(config: HostInitConfig, runner: R) -> Self {
        Self { config, runner }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.config.root.join(relative)
    }

    fn runit_dir(&self, unit: &ServiceUnit) -> PathBuf {
        self.path("etc/sv").join(&unit.name)
    }

    fn runit_link(&self, unit: &ServiceUnit) -> PathBuf {
        self.path("etc/service").join(&unit.name)
    }

    fn upstart_override(&self, unit: &ServiceUnit) -> PathBuf {
        self.path("etc/init").join(format!("{}.override", unit.name))
    }

    fn files(&self, unit: &ServiceUnit) -> Vec<UnitFile> {
        match &unit.init {
            InitSystem::None => Vec::new(),
            InitSystem::Systemd { socket_template, .. } => {
                let dir = self.path("usr/lib/systemd/system");
                let mut files = vec![UnitFile {
                    path: dir.join(format!("{}.service", unit.name)),
                    template: unit.template.clone(),
                    mode: 0o644,
                }];
                if !unit.variable("sockets").is_empty() {
                    files.push(UnitFile {
                        path: dir.join(format!("{}.socket", unit.name)),
                        template: socket_template.clone().unwrap_or_else(|| unit::SYSTEMD_SOCKET.into()),
                        mode: 0o644,
                    });
                }
                files
            }
            InitSystem::Upstart { .. } => vec![UnitFile {
                path: self.path("etc/init").join(format!("{}.conf", unit.name)),
                template: unit.template.clone(),
                mode: 0o600,
            }],
            InitSystem::Sysv { .. } => vec![UnitFile {
                path: self.path("etc/init.d").join(&unit.name),
                template: unit.template.clone(),
                mode: 0o755,
            }],
            InitSystem::Runit { .. } => vec![UnitFile {
                path: self.runit_dir(unit).join("run"),
                template: unit.template.clone(),
                mode: 0o755,
            }],
        }
    }

    fn run(&self, unit: &ServiceUnit, program: &str, args: &[&str]) -> Result<()> {
        let invocation = Invocation::new(program, self.config.timeout).args(args.iter().copied());
        tracing::debug!(service = %unit.name, command = %invocation.display(), "Running init system command");

        match self.runner.run(&invocation) {
            Ok(_) => Ok(()),
            Err(e @ CommandError::Timeout { .. }) => Err(e.into()),
            Err(source) => Err(Error::InitSystem {
                service: unit.name.clone(),
                source,
            }),
        }
    }

    fn write_unit_file(&self, unit: &ServiceUnit, file: &UnitFile) -> Result<()> {
        let mut variables = unit.variables.clone();
        variables.insert("listen_streams".to_string(), unit::listen_streams(unit.variable("sockets")));
        let contents = unit::render(&file.template, &variables)?;

        if let Some(parent) = file.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file.path, contents)?;
        set_mode(&file.path, file.mode)?;

        tracing::info!(service = %unit.name, path = %file.path.display(), "Wrote unit file");
        Ok(())
    }

    fn reload(&self, unit: &ServiceUnit) -> Result<()> {
        match unit.init {
            InitSystem::Systemd { .. } => self.run(unit, "systemctl", &["daemon-reload"]),
            InitSystem::Upstart { .. } => self.run(unit, "initctl", &["reload-configuration"]),
            _ => Ok(()),
        }
    }
}

impl<R: Runner> InitSystemAdapter for HostInitAdapter<R> {
    fn create(&self, unit: &ServiceUnit) -> Result<()> {
        if !unit.init.is_configured() {
            return Err(Error::Configuration(format!(
                "service '{}' has no init system configured",
                unit.name
            )));
        }

        for file in self.files(unit) {
            self.write_unit_file(unit, &file)?;
        }
        self.reload(unit)
    }

    fn action(&self, unit: &ServiceUnit, action: ServiceAction) -> Result<()> {
        tracing::info!(service = %unit.name, init = %unit.init, action = %action, "Service action");
        let verb = action.to_string();

        match (&unit.init, action) {
            (InitSystem::None, _) => Err(Error::Configuration(format!(
                "service '{}' has no init system configured",
                unit.name
            ))),

            (InitSystem::Systemd { .. }, _) => {
                let service = format!("{}.service", unit.name);
                self.run(unit, "systemctl", &[verb.as_str(), service.as_str()])
            }

            (InitSystem::Upstart { .. }, ServiceAction::Enable) => {
                remove_if_exists(&self.upstart_override(unit))?;
                Ok(())
            }
            (InitSystem::Upstart { .. }, ServiceAction::Disable) => {
                std::fs::write(self.upstart_override(unit), "manual\n")?;
                Ok(())
            }
            (InitSystem::Upstart { .. }, _) => self.run(unit, "initctl", &[verb.as_str(), unit.name.as_str()]),

            (InitSystem::Sysv { .. }, ServiceAction::Enable) => {
                self.run(unit, "update-rc.d", &[unit.name.as_str(), "defaults"])
            }
            (InitSystem::Sysv { .. }, ServiceAction::Disable) => {
                self.run(unit, "update-rc.d", &["-f", unit.name.as_str(), "remove"])
            }
            (InitSystem::Sysv { .. }, _) => self.run(unit, "service", &[unit.name.as_str(), verb.as_str()]),

            (InitSystem::Runit { .. }, ServiceAction::Enable) => {
                let link = self.runit_link(unit);
                if link.symlink_metadata().is_err() {
                    if let Some(parent) = link.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    symlink(&self.runit_dir(unit), &link)?;
                }
                Ok(())
            }
            (InitSystem::Runit { .. }, ServiceAction::Disable) => {
                remove_if_exists(&self.runit_link(unit))?;
                Ok(())
            }
            (InitSystem::Runit { .. }, _) => {
                let link = self.runit_link(unit);
                let target = link.to_string_lossy();
                self.run(unit, "sv", &[verb.as_str(), target.as_ref()])
            }
        }
    }

    fn remove(&self, unit: &ServiceUnit) -> Result<()> {
        // runit services are only taken out of supervision
        if let InitSystem::Runit { .. } = unit.init {
            return self.action(unit, ServiceAction::Disable);
        }

        if let Err(e) = self.action(unit, ServiceAction::Stop) {
            tracing::warn!(service = %unit.name, error = %e, "Stopping service before removal failed");
        }
        self.action(unit, ServiceAction::Disable)?;

        for file in self.files(unit) {
            if remove_if_exists(&file.path)? {
                tracing::info!(service = %unit.name, path = %file.path.display(), "Removed unit file");
            }
        }
        self.reload(unit)
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> Result<()> {
    Err(Error::Configuration("runit services require a unix host".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Output;
    use crate::config::DesiredContainerSpec;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        fail: Mutex<Option<String>>,
    }

    impl RecordingRunner {
        fn failing_on(program: &str) -> Self {
            let runner = Self::default();
            *runner.fail.lock() = Some(program.to_string());
            runner
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Runner for RecordingRunner {
        fn run(&self, invocation: &Invocation) -> std::result::Result<Output, CommandError> {
            let command = invocation.display();
            self.calls.lock().push(command.clone());
            if self.fail.lock().as_deref() == Some(invocation.program.as_str()) {
                return Err(CommandError::Failed {
                    command,
                    code: Some(1),
                    stderr: "unit not loaded".into(),
                });
            }
            Ok(Output::default())
        }
    }

    fn unit(init: InitSystem) -> ServiceUnit {
        let spec = DesiredContainerSpec::builder()
            .image("registry/web:2")
            .port("8080:80")
            .cmd_timeout(20)
            .init_system(init)
            .build();
        ServiceUnit::from_spec(&spec).unwrap()
    }

    fn adapter(root: &Path) -> HostInitAdapter<RecordingRunner> {
        HostInitAdapter::with_runner(HostInitConfig::new().root(root), RecordingRunner::default())
    }

    #[test]
    fn test_systemd_create_writes_service_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let unit = unit(InitSystem::Systemd { template: None, socket_template: None });

        adapter.create(&unit).unwrap();

        let service = std::fs::read_to_string(dir.path().join("usr/lib/systemd/system/web.service")).unwrap();
        assert!(service.contains("ExecStop=/usr/bin/docker stop -t 20 web"));
        let socket = std::fs::read_to_string(dir.path().join("usr/lib/systemd/system/web.socket")).unwrap();
        assert!(socket.contains("ListenStream=80"));
        assert_eq!(adapter.runner.calls(), vec!["systemctl daemon-reload"]);
    }

    #[test]
    fn test_systemd_actions() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let unit = unit(InitSystem::Systemd { template: None, socket_template: None });

        adapter.action(&unit, ServiceAction::Start).unwrap();
        adapter.action(&unit, ServiceAction::Enable).unwrap();
        assert_eq!(
            adapter.runner.calls(),
            vec!["systemctl start web.service", "systemctl enable web.service"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.create(&unit(InitSystem::Upstart { template: None })).unwrap();
        adapter.create(&unit(InitSystem::Sysv { template: None })).unwrap();

        let mode = |p: &str| std::fs::metadata(dir.path().join(p)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("etc/init/web.conf"), 0o600);
        assert_eq!(mode("etc/init.d/web"), 0o755);
    }

    #[test]
    fn test_upstart_enable_disable_uses_override() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let unit = unit(InitSystem::Upstart { template: None });
        adapter.create(&unit).unwrap();

        let override_file = dir.path().join("etc/init/web.override");
        adapter.action(&unit, ServiceAction::Disable).unwrap();
        assert_eq!(std::fs::read_to_string(&override_file).unwrap(), "manual\n");

        adapter.action(&unit, ServiceAction::Enable).unwrap();
        assert!(!override_file.exists());
    }

    #[test]
    fn test_sysv_remove_stops_disables_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let unit = unit(InitSystem::Sysv { template: None });
        adapter.create(&unit).unwrap();

        adapter.remove(&unit).unwrap();

        assert!(!dir.path().join("etc/init.d/web").exists());
        assert_eq!(
            adapter.runner.calls(),
            vec!["service web stop", "update-rc.d -f web remove"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_runit_enable_links_and_remove_only_disables() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let unit = unit(InitSystem::Runit { template: None });
        adapter.create(&unit).unwrap();
        adapter.action(&unit, ServiceAction::Enable).unwrap();

        let link = dir.path().join("etc/service/web");
        assert_eq!(std::fs::read_link(&link).unwrap(), dir.path().join("etc/sv/web"));

        adapter.remove(&unit).unwrap();
        assert!(link.symlink_metadata().is_err());
        assert!(dir.path().join("etc/sv/web/run").exists());
        assert!(adapter.runner.calls().is_empty());
    }

    #[test]
    fn test_command_failure_is_init_system_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = HostInitAdapter::with_runner(
            HostInitConfig::new().root(dir.path()),
            RecordingRunner::failing_on("systemctl"),
        );
        let unit = unit(InitSystem::Systemd { template: None, socket_template: None });

        let err = adapter.action(&unit, ServiceAction::Start).unwrap_err();
        match err {
            Error::InitSystem { service, source } => {
                assert_eq!(service, "web");
                assert_eq!(source.stderr(), "unit not loaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_init_system_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let mut unit = unit(InitSystem::Sysv { template: None });
        unit.init = InitSystem::None;
        assert!(matches!(adapter.create(&unit), Err(Error::Configuration(_))));
    }
}
