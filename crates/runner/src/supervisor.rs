//! Plugin subprocess supervision: spawn, readiness probing, termination.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use gantry_config::{LoggerOptions, PluginDescriptor, PluginKind};
use gantry_transport::LeafCredential;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Result, RunnerError};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// A running plugin subprocess and its bookkeeping.
///
/// The process handle, port lease, and server credential are owned here;
/// the registry drops them together when the plugin closes.
pub struct SupervisedPlugin {
    descriptor: PluginDescriptor,
    port: u16,
    pid: i32,
    credential: LeafCredential,
    // Held so the runtime's kill-on-drop backstop survives as long as the
    // supervisor; never waited on.
    _child: Mutex<Child>,
}

impl SupervisedPlugin {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn server_credential(&self) -> &LeafCredential {
        &self.credential
    }

    /// Terminate the plugin's process group. Idempotent: a group that is
    /// already gone counts as closed.
    pub fn close(&self) -> Result<()> {
        debug!(plugin = %self.descriptor.name, pid = self.pid, "terminating plugin process group");
        terminate_group(self.pid).map_err(|source| RunnerError::Teardown {
            plugin: self.descriptor.name.clone(),
            pgid: self.pid,
            source,
        })
    }
}

/// Spawn one plugin subprocess and wait for its listener to come up.
pub(crate) async fn spawn_plugin(
    descriptor: &PluginDescriptor,
    credential: LeafCredential,
    port: u16,
    logger_options: Option<&LoggerOptions>,
    cancel: &CancellationToken,
) -> Result<SupervisedPlugin> {
    let command = match descriptor.kind {
        PluginKind::BuildAndRun => build_and_run_command(descriptor, &credential, port, logger_options)?,
    };
    spawn_supervised(descriptor, command, credential, port, cancel, STARTUP_TIMEOUT).await
}

/// Build the compile-and-run invocation for a plugin source directory.
///
/// The argument protocol mirrors what the plugin stub parses: the port, the
/// serialized server credential, the plugin name, and the encoded logger
/// options.
fn build_and_run_command(
    descriptor: &PluginDescriptor,
    credential: &LeafCredential,
    port: u16,
    logger_options: Option<&LoggerOptions>,
) -> Result<Command> {
    let plugin_dir = std::fs::canonicalize(&descriptor.path).map_err(|source| RunnerError::Spawn {
        plugin: descriptor.name.clone(),
        source,
    })?;
    let serialized = credential.serialize()?;

    let mut command = Command::new("/usr/bin/env");
    command.arg("cargo").arg("run").arg("--");
    command.arg("--port").arg(port.to_string());
    command.arg("--tls_key_and_cert").arg(serialized);
    command.arg("--plugin_name").arg(&descriptor.name);
    if let Some(options) = logger_options {
        command.arg("--logger_options").arg(options.encode()?);
    }
    command.current_dir(&plugin_dir);
    configure(&mut command);

    debug!(plugin = %descriptor.name, dir = %plugin_dir.display(), port, "built plugin command");
    Ok(command)
}

/// Process-group and stdio setup shared by every plugin spawn.
fn configure(command: &mut Command) {
    command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // New process group, so a group-wide signal sweeps any grandchildren the
    // toolchain forks during the build step.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            if libc::setpgid(0, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

async fn spawn_supervised(
    descriptor: &PluginDescriptor,
    mut command: Command,
    credential: LeafCredential,
    port: u16,
    cancel: &CancellationToken,
    startup_timeout: Duration,
) -> Result<SupervisedPlugin> {
    let child = command.spawn().map_err(|source| RunnerError::Spawn {
        plugin: descriptor.name.clone(),
        source,
    })?;
    let pid = child.id().map(|id| id as i32).ok_or_else(|| RunnerError::Spawn {
        plugin: descriptor.name.clone(),
        source: std::io::Error::other("plugin process exited before supervision began"),
    })?;
    info!(plugin = %descriptor.name, pid, port, "plugin process started");

    if let Err(probe_error) = wait_until_ready(&descriptor.name, port, startup_timeout, cancel).await
    {
        if let Err(kill_error) = terminate_group(pid) {
            error!(
                plugin = %descriptor.name,
                error = %kill_error,
                "failed to terminate plugin process group after startup failure"
            );
        }
        return Err(probe_error);
    }

    Ok(SupervisedPlugin {
        descriptor: descriptor.clone(),
        port,
        pid,
        credential,
        _child: Mutex::new(child),
    })
}

/// Probe `localhost:port` every 100 ms until the plugin's listener accepts,
/// the startup deadline passes, or the caller cancels.
///
/// The dial is authoritative for readiness: all the parent needs to know is
/// that the listening socket exists; the TLS handshake happens on the first
/// real call.
async fn wait_until_ready(
    plugin: &str,
    port: u16,
    startup_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + startup_timeout;
    debug!(plugin, port, "probing plugin readiness");

    loop {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(RunnerError::StartTimeout {
                plugin: plugin.to_string(),
                timeout: startup_timeout,
            });
        }

        let dial = timeout(DIAL_TIMEOUT, TcpStream::connect(("localhost", port)));
        tokio::select! {
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
            result = dial => {
                if let Ok(Ok(stream)) = result {
                    drop(stream);
                    debug!(plugin, port, "plugin is ready");
                    return Ok(());
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
        }
    }
}

/// SIGTERM the whole process group. A group that no longer exists is not an
/// error.
#[cfg(unix)]
fn terminate_group(pgid: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == -1 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(error);
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate_group(_pgid: i32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use gantry_transport::{PrivateCa, Role};
    use std::sync::OnceLock;

    pub(crate) fn test_credential() -> LeafCredential {
        static CA: OnceLock<PrivateCa> = OnceLock::new();
        CA.get_or_init(|| PrivateCa::generate().expect("generate CA"))
            .issue("test", Role::Server)
            .expect("issue credential")
    }

    fn descriptor(name: &str) -> PluginDescriptor {
        PluginDescriptor {
            name: name.to_string(),
            path: ".".into(),
            kind: PluginKind::BuildAndRun,
        }
    }

    /// A long-lived child that never binds anything, standing in for a
    /// plugin whose listener is managed elsewhere in the test.
    pub(crate) fn sleeper_command() -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg("exec sleep 30");
        configure(&mut command);
        command
    }

    pub(crate) async fn spawn_sleeper(port: u16) -> Result<SupervisedPlugin> {
        let cancel = CancellationToken::new();
        spawn_supervised(
            &descriptor("test"),
            sleeper_command(),
            test_credential(),
            port,
            &cancel,
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn spawn_reports_ready_once_port_accepts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let supervised = spawn_sleeper(port).await.unwrap();
        assert_eq!(supervised.port(), port);
        assert_eq!(supervised.name(), "test");
        assert!(supervised.pid() > 0);

        supervised.close().unwrap();
        // Second close is a no-op even once the group is gone.
        supervised.close().unwrap();
    }

    #[tokio::test]
    async fn spawn_times_out_when_nothing_binds() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let cancel = CancellationToken::new();
        let result = spawn_supervised(
            &descriptor("slow"),
            sleeper_command(),
            test_credential(),
            port,
            &cancel,
            Duration::from_millis(400),
        )
        .await;
        match result {
            Err(RunnerError::StartTimeout { plugin, .. }) => assert_eq!(plugin, "slow"),
            other => panic!("expected start timeout, got {:?}", other.map(|p| p.pid())),
        }
    }

    #[tokio::test]
    async fn spawn_honors_pre_cancelled_token() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = spawn_supervised(
            &descriptor("cancelled"),
            sleeper_command(),
            test_credential(),
            port,
            &cancel,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(RunnerError::Cancelled)));
    }

    #[tokio::test]
    async fn readiness_probe_succeeds_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        wait_until_ready("probe", port, Duration::from_secs(2), &cancel)
            .await
            .unwrap();
    }

    #[test]
    fn build_command_requires_existing_plugin_dir() {
        let descriptor = PluginDescriptor {
            name: "ghost".to_string(),
            path: "/nonexistent/plugin/dir".into(),
            kind: PluginKind::BuildAndRun,
        };
        let result = build_and_run_command(&descriptor, &test_credential(), 40001, None);
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }
}
