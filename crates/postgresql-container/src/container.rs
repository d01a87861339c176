//! Docker container management for disposable PostgreSQL servers

use crate::endpoint::DatabaseEndpoint;
use anyhow::{Context, Result};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

/// Image used when none is configured
pub const DEFAULT_IMAGE: &str = "postgres:9.6.12";

/// Port PostgreSQL listens on inside the container
pub const POSTGRES_PORT: u16 = 5432;

const BIND_ADDRESS: &str = "127.0.0.1";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

// $1 = watched pid, $2 = docker command, $3 = container name
const REAPER_SCRIPT: &str =
    r#"while kill -0 "$1" 2>/dev/null; do sleep 1; done; "$2" rm -f "$3" >/dev/null 2>&1"#;

/// A throwaway PostgreSQL server running in Docker
pub struct PostgresContainer {
    /// Container name
    pub container_name: String,
    /// Image name
    pub image: String,
    /// Database created on first start (`POSTGRES_DB`)
    pub database_name: String,
    pub username: String,
    pub password: String,
    /// Requested host port, 0 lets Docker pick a free one
    pub host_port: u16,
    /// Docker CLI executable
    pub docker: String,
    /// Set once `docker run` has been invoked; a container may exist from then on
    created: bool,
    bound_port: Option<u16>,
}

impl PostgresContainer {
    /// Creates a new container configuration. Nothing is started yet.
    pub fn new(container_name: &str) -> Self {
        Self {
            container_name: container_name.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            database_name: "test".to_string(),
            username: "test".to_string(),
            password: "test".to_string(),
            host_port: 0,
            docker: "docker".to_string(),
            created: false,
            bound_port: None,
        }
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    pub fn with_database_name(mut self, database_name: &str) -> Self {
        self.database_name = database_name.to_string();
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    pub fn with_host_port(mut self, host_port: u16) -> Self {
        self.host_port = host_port;
        self
    }

    pub fn with_docker_command(mut self, docker: &str) -> Self {
        self.docker = docker.to_string();
        self
    }

    fn docker_command(&self) -> Command {
        Command::new(&self.docker)
    }

    /// Arguments passed to `docker` to launch the container
    pub fn run_args(&self) -> Vec<String> {
        let publish = if self.host_port == 0 {
            format!("{BIND_ADDRESS}::{POSTGRES_PORT}")
        } else {
            format!("{BIND_ADDRESS}:{}:{POSTGRES_PORT}", self.host_port)
        };

        vec![
            "run".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
            "-e".to_string(),
            format!("POSTGRES_USER={}", self.username),
            "-e".to_string(),
            format!("POSTGRES_PASSWORD={}", self.password),
            "-e".to_string(),
            format!("POSTGRES_DB={}", self.database_name),
            "-p".to_string(),
            publish,
            "-d".to_string(),
            self.image.clone(),
        ]
    }

    /// Starts the PostgreSQL container and records the host port it is bound to.
    ///
    /// If any step after `docker run` fails, the container is removed again
    /// before the error is returned.
    pub fn start(&mut self) -> Result<()> {
        info!(
            "Starting PostgreSQL container {} from {}",
            self.container_name, self.image
        );

        // A container left over from an aborted run would hold the name
        self.remove();

        self.created = true;
        match self.run_and_bind() {
            Ok(port) => {
                info!("Container {} bound to host port {}", self.container_name, port);
                self.bound_port = Some(port);
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    fn run_and_bind(&self) -> Result<u16> {
        let output = self
            .docker_command()
            .args(self.run_args())
            .output()
            .context("Failed to execute docker run command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to start container: {stderr}");
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Started container: {}", container_id);

        self.query_bound_port()
    }

    fn query_bound_port(&self) -> Result<u16> {
        let output = self
            .docker_command()
            .args([
                "port",
                &self.container_name,
                &format!("{POSTGRES_PORT}/tcp"),
            ])
            .output()
            .context("Failed to execute docker port command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to look up container port: {stderr}");
        }

        parse_port_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Endpoint of the started container. The server may not accept
    /// connections yet; see [`PostgresContainer::wait_until_ready`].
    pub fn endpoint(&self) -> Result<DatabaseEndpoint> {
        let port = self
            .bound_port
            .with_context(|| format!("Container {} has not been started", self.container_name))?;

        Ok(DatabaseEndpoint::new(
            BIND_ADDRESS,
            port,
            &self.username,
            &self.password,
            &self.database_name,
        ))
    }

    /// Waits for PostgreSQL to be ready to accept connections
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<DatabaseEndpoint> {
        let endpoint = self.endpoint()?;
        info!("Waiting for PostgreSQL at {} to be ready...", endpoint);

        let start = Instant::now();
        let mut last_error = None;

        while start.elapsed() < timeout {
            let attempt_timeout = timeout
                .saturating_sub(start.elapsed())
                .min(CONNECT_ATTEMPT_TIMEOUT);
            let attempt = tokio::time::timeout(attempt_timeout, test_connection(&endpoint))
                .await
                .unwrap_or_else(|_| {
                    Err(anyhow::anyhow!(
                        "Connection attempt timed out after {:?}",
                        attempt_timeout
                    ))
                });

            match attempt {
                Ok(()) => {
                    info!("PostgreSQL is ready after {:?}", start.elapsed());
                    return Ok(endpoint);
                }
                Err(e) => {
                    debug!("Connection attempt failed: {:#}", e);
                    last_error = Some(e);
                    let remaining = timeout.saturating_sub(start.elapsed());
                    tokio::time::sleep(READY_POLL_INTERVAL.min(remaining)).await;
                }
            }
        }

        let last_error = last_error
            .map(|e| format!("{e:#}"))
            .unwrap_or_else(|| "no connection attempted".to_string());
        anyhow::bail!(
            "PostgreSQL did not become ready within {} seconds: {last_error}",
            timeout.as_secs()
        )
    }

    /// Stops and removes the container. Does nothing if `docker run` was never
    /// invoked or the container was already removed.
    pub fn stop(&mut self) {
        self.bound_port = None;
        if !std::mem::take(&mut self.created) {
            return;
        }
        info!("Stopping container: {}", self.container_name);
        self.remove();
        info!("Container stopped and removed");
    }

    /// Spawns a detached shell that removes the container once process `pid`
    /// has exited.
    ///
    /// For containers owned by a value that is never dropped, such as a
    /// static shared across a test binary. The reaper keeps running when the
    /// returned handle is dropped.
    pub fn remove_when_process_exits(&self, pid: u32) -> Result<Child> {
        Command::new("sh")
            .args([
                "-c",
                REAPER_SCRIPT,
                "pg-container-reaper",
                &pid.to_string(),
                &self.docker,
                &self.container_name,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn reaper for {}", self.container_name))
    }

    fn remove(&self) {
        match self
            .docker_command()
            .args(["rm", "-f", &self.container_name])
            .stdout(Stdio::null())
            .output()
        {
            Ok(output) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!("Failed to remove container (may not exist): {}", stderr.trim());
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to run docker rm for {}: {}", self.container_name, e),
        }
    }

    /// Gets logs from the container
    pub fn logs(&self) -> Result<String> {
        let output = self
            .docker_command()
            .args(["logs", &self.container_name])
            .output()
            .context("Failed to get container logs")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(format!("STDOUT:\n{stdout}\n\nSTDERR:\n{stderr}"))
    }
}

impl Drop for PostgresContainer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens a connection and runs a trivial query
async fn test_connection(endpoint: &DatabaseEndpoint) -> Result<()> {
    let mut config = endpoint.to_pg_config();
    config.connect_timeout(CONNECT_ATTEMPT_TIMEOUT);

    let (client, connection) = config
        .connect(NoTls)
        .await
        .context("Failed to connect")?;

    let driver = tokio::spawn(connection);

    client
        .simple_query("SELECT 1")
        .await
        .context("Failed to execute test query")?;

    drop(client);
    let _ = driver.await;
    Ok(())
}

/// Extracts the host port from `docker port` output.
///
/// Docker prints one binding per line, e.g. `127.0.0.1:49153` or `[::]:49153`.
pub fn parse_port_output(output: &str) -> Result<u16> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| {
            line.rsplit_once(':')
                .and_then(|(_, port)| port.parse::<u16>().ok())
        })
        .with_context(|| format!("No host port found in docker port output: {output:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_ephemeral_port() {
        let container = PostgresContainer::new("harness-it").with_database_name("mydb");

        assert_eq!(
            container.run_args(),
            vec![
                "run",
                "--name",
                "harness-it",
                "-e",
                "POSTGRES_USER=test",
                "-e",
                "POSTGRES_PASSWORD=test",
                "-e",
                "POSTGRES_DB=mydb",
                "-p",
                "127.0.0.1::5432",
                "-d",
                "postgres:9.6.12",
            ]
        );
    }

    #[test]
    fn test_run_args_fixed_port_and_image() {
        let container = PostgresContainer::new("harness-it")
            .with_image("postgres:16")
            .with_credentials("app", "secret")
            .with_host_port(15439);
        let args = container.run_args();

        assert!(args.contains(&"127.0.0.1:15439:5432".to_string()));
        assert!(args.contains(&"POSTGRES_USER=app".to_string()));
        assert!(args.contains(&"POSTGRES_PASSWORD=secret".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("postgres:16"));
    }

    #[test]
    fn test_parse_port_output() {
        assert_eq!(parse_port_output("127.0.0.1:49153\n").unwrap(), 49153);
        assert_eq!(parse_port_output("0.0.0.0:32768\n[::]:32768\n").unwrap(), 32768);
        assert_eq!(parse_port_output("\n[::]:5433").unwrap(), 5433);
    }

    #[test]
    fn test_parse_port_output_rejects_garbage() {
        assert!(parse_port_output("").is_err());
        assert!(parse_port_output("Error: No public port '5432/tcp' published").is_err());
    }

    #[test]
    fn test_endpoint_before_start_fails() {
        let container = PostgresContainer::new("never-started");
        assert!(container.endpoint().is_err());
    }

    // Writing an executable while another test thread forks can fail the
    // exec with ETXTBSY, so the fake-docker tests run one at a time.
    #[cfg(unix)]
    static FAKE_DOCKER_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[cfg(unix)]
    fn serial() -> std::sync::MutexGuard<'static, ()> {
        FAKE_DOCKER_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A stand-in `docker` executable that appends each invocation to `calls.log`.
    #[cfg(unix)]
    fn fake_docker(dir: &std::path::Path, run: &str, port: &str) -> (String, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("docker");
        let body = format!(
            "#!/bin/sh\necho \"$*\" >> '{}'\ncase \"$1\" in\n  run) {run} ;;\n  port) {port} ;;\nesac\n",
            log.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        (script.display().to_string(), log)
    }

    #[cfg(unix)]
    fn docker_calls(log: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(|line| line.split(' ').take(2).collect::<Vec<_>>().join(" "))
            .collect()
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_port_lookup_removes_container() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let (docker, log) = fake_docker(dir.path(), "echo 3f2a9c", "exit 1");

        let mut container = PostgresContainer::new("port-lookup-fails").with_docker_command(&docker);
        assert!(container.start().is_err());
        assert!(container.endpoint().is_err());
        drop(container);

        assert_eq!(
            docker_calls(&log),
            vec!["rm -f", "run --name", "port port-lookup-fails", "rm -f"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_run_removes_container() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let (docker, log) = fake_docker(
            dir.path(),
            "echo 'port is already allocated' >&2; exit 125",
            "exit 1",
        );

        let mut container = PostgresContainer::new("port-clash")
            .with_docker_command(&docker)
            .with_host_port(5432);
        let err = container.start().unwrap_err();
        assert!(format!("{err:#}").contains("port is already allocated"));
        container.stop();
        drop(container);

        assert_eq!(docker_calls(&log), vec!["rm -f", "run --name", "rm -f"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_started_container_removed_once() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let (docker, log) = fake_docker(dir.path(), "echo 3f2a9c", "echo 127.0.0.1:49153");

        let mut container = PostgresContainer::new("started").with_docker_command(&docker);
        container.start().unwrap();
        assert_eq!(container.endpoint().unwrap().port(), 49153);
        container.stop();
        container.stop();
        drop(container);

        assert_eq!(
            docker_calls(&log),
            vec!["rm -f", "run --name", "port started", "rm -f"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_reaper_removes_container_after_process_exit() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let (docker, log) = fake_docker(dir.path(), "echo 3f2a9c", "echo 127.0.0.1:49153");
        let container = PostgresContainer::new("orphaned").with_docker_command(&docker);

        let mut exited = Command::new("true").spawn().unwrap();
        exited.wait().unwrap();

        let mut reaper = container.remove_when_process_exits(exited.id()).unwrap();
        assert!(reaper.wait().unwrap().success());

        assert_eq!(docker_calls(&log), vec!["rm -f"]);
        assert!(std::fs::read_to_string(&log).unwrap().contains("rm -f orphaned"));
    }

    #[tokio::test]
    async fn test_wait_until_ready_bounds_unresponsive_server() {
        // Accepts connections but never answers the startup message
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepting = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut container = PostgresContainer::new("unresponsive");
        container.bound_port = Some(port);

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            container.wait_until_ready(Duration::from_millis(300)),
        )
        .await
        .expect("wait_until_ready overran its timeout");

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        accepting.abort();
    }
}
