//! Server-under-test configuration
//!
//! `ServerConfig` describes one invocation of the server binary, `ServerArgs`
//! assembles its documented command-line flags, and `Timeouts` bounds every
//! blocking step of the supervisor.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the server binary
pub const ION_PATH_ENV: &str = "ION_PATH";

/// Binary used when `ION_PATH` is not set
pub const DEFAULT_EXECUTABLE: &str = "ion-server";

/// Configuration for starting the server under test
#[derive(Debug, Clone)]
pub struct ServerConfig {
    executable: PathBuf,
    port: u16,
    pass_port: bool,
    args: Vec<String>,
    env: Vec<(OsString, OsString)>,
    wait_for_port: bool,
    ready_host: String,
}

impl ServerConfig {
    /// Create a configuration builder
    pub fn builder(executable: impl Into<PathBuf>, port: u16) -> ServerConfigBuilder {
        ServerConfigBuilder::new(executable, port)
    }

    /// Builder for the binary named by `ION_PATH` (or `ion-server` on `PATH`)
    pub fn from_env(port: u16) -> ServerConfigBuilder {
        let executable = std::env::var_os(ION_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE));
        ServerConfigBuilder::new(executable, port)
    }

    /// Executable path
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Arguments after the port flag
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment overrides
    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    /// Whether `start` waits for the port to accept connections
    pub fn wait_for_port(&self) -> bool {
        self.wait_for_port
    }

    /// Host the readiness probe connects to
    pub fn ready_host(&self) -> &str {
        &self.ready_host
    }

    /// Full argument vector passed to the executable
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if self.pass_port {
            argv.push("-p".to_string());
            argv.push(self.port.to_string());
        }
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Resolved command line, executable first
    pub fn command_line(&self) -> Vec<String> {
        let mut line = vec![self.executable.display().to_string()];
        line.extend(self.argv());
        line
    }
}

/// Builder for [`ServerConfig`]
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    fn new(executable: impl Into<PathBuf>, port: u16) -> Self {
        ServerConfigBuilder {
            config: ServerConfig {
                executable: executable.into(),
                port,
                pass_port: true,
                args: Vec::new(),
                env: Vec::new(),
                wait_for_port: true,
                ready_host: "127.0.0.1".to_string(),
            },
        }
    }

    /// Replace the argument list
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append arguments after the current list
    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Use a typed argument set
    pub fn server_args(self, args: ServerArgs) -> Self {
        self.args(args.into_args())
    }

    /// Add an environment override
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    /// Whether to prepend `-p <port>` to the arguments (default: true)
    pub fn pass_port(mut self, pass: bool) -> Self {
        self.config.pass_port = pass;
        self
    }

    /// Whether `start` waits for the port to open (default: true)
    pub fn wait_for_port(mut self, wait: bool) -> Self {
        self.config.wait_for_port = wait;
        self
    }

    /// Host used by the readiness probe (default: 127.0.0.1)
    pub fn ready_host(mut self, host: impl Into<String>) -> Self {
        self.config.ready_host = host.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Typed assembly of the server's command-line flags
///
/// The port flag is owned by [`ServerConfig`], everything else lives here.
#[derive(Debug, Clone, Default)]
pub struct ServerArgs {
    args: Vec<String>,
}

impl ServerArgs {
    /// Empty argument set
    pub fn new() -> Self {
        ServerArgs::default()
    }

    /// The argument set the system tests run with: a static mount, trace
    /// logging, the diagnostic routes and TLS material.
    pub fn under_test_defaults(
        static_dir: impl AsRef<Path>,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Self {
        ServerArgs::new()
            .static_mount("/static", static_dir)
            .log_level("trace")
            .under_test()
            .tls(cert, key)
    }

    fn flag(mut self, flag: &str) -> Self {
        self.args.push(flag.to_string());
        self
    }

    fn flag_path(mut self, flag: &str, path: &Path) -> Self {
        self.args.push(flag.to_string());
        self.args.push(path.display().to_string());
        self
    }

    /// `-s <url-prefix> <dir>`
    pub fn static_mount(mut self, url_prefix: &str, dir: impl AsRef<Path>) -> Self {
        self.args.push("-s".to_string());
        self.args.push(url_prefix.to_string());
        self.args.push(dir.as_ref().display().to_string());
        self
    }

    /// `-l <level>`
    pub fn log_level(mut self, level: &str) -> Self {
        self.args.push("-l".to_string());
        self.args.push(level.to_string());
        self
    }

    /// `--under-test`
    pub fn under_test(self) -> Self {
        self.flag("--under-test")
    }

    /// `--tls-cert-path <file> --tls-key-path <file>`
    pub fn tls(self, cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Self {
        self.flag_path("--tls-cert-path", cert.as_ref())
            .flag_path("--tls-key-path", key.as_ref())
    }

    /// `--access-log <path>`
    pub fn access_log(self, path: impl AsRef<Path>) -> Self {
        self.flag_path("--access-log", path.as_ref())
    }

    /// `--custom-404-file-path <file>`
    pub fn custom_404(self, path: impl AsRef<Path>) -> Self {
        self.flag_path("--custom-404-file-path", path.as_ref())
    }

    /// `--cleartext`
    pub fn cleartext(self) -> Self {
        self.flag("--cleartext")
    }

    /// `--status-page`
    pub fn status_page(self) -> Self {
        self.flag("--status-page")
    }

    /// `--help`
    pub fn help(self) -> Self {
        self.flag("--help")
    }

    /// `--version`
    pub fn version(self) -> Self {
        self.flag("--version")
    }

    /// Append an arbitrary argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Drop every occurrence of a flag (e.g. run without `--under-test`)
    pub fn without(mut self, flag: &str) -> Self {
        self.args.retain(|a| a != flag);
        self
    }

    /// Borrow the assembled arguments
    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    /// Consume into the argument vector
    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

/// Upper bounds for every blocking step of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Window in which an exit counts as "crashed immediately"
    pub startup_window: Duration,
    /// Maximum wait for the port to accept connections
    pub port_wait: Duration,
    /// Delay between readiness attempts
    pub poll_interval: Duration,
    /// Wait after SIGTERM before escalating
    pub graceful_stop: Duration,
    /// Wait after SIGKILL before giving up on the exit status
    pub kill: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            startup_window: Duration::from_millis(100),
            port_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            graceful_stop: Duration::from_secs(5),
            kill: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    /// Defaults, overridden by any of these variables (milliseconds):
    /// - `ION_HARNESS_STARTUP_WINDOW_MS`
    /// - `ION_HARNESS_PORT_WAIT_MS`
    /// - `ION_HARNESS_POLL_INTERVAL_MS`
    /// - `ION_HARNESS_GRACEFUL_STOP_MS`
    /// - `ION_HARNESS_KILL_MS`
    pub fn from_env() -> Self {
        let defaults = Timeouts::default();
        Timeouts {
            startup_window: env_millis("ION_HARNESS_STARTUP_WINDOW_MS")
                .unwrap_or(defaults.startup_window),
            port_wait: env_millis("ION_HARNESS_PORT_WAIT_MS").unwrap_or(defaults.port_wait),
            poll_interval: env_millis("ION_HARNESS_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval)
                .max(Duration::from_millis(1)),
            graceful_stop: env_millis("ION_HARNESS_GRACEFUL_STOP_MS")
                .unwrap_or(defaults.graceful_stop),
            kill: env_millis("ION_HARNESS_KILL_MS").unwrap_or(defaults.kill),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_with_port() {
        let config = ServerConfig::builder("/usr/bin/ion-server", 8443)
            .args(["--under-test"])
            .extra_args(["--cleartext"])
            .build();

        assert_eq!(
            config.command_line(),
            vec!["/usr/bin/ion-server", "-p", "8443", "--under-test", "--cleartext"]
        );
        assert!(config.wait_for_port());
        assert_eq!(config.ready_host(), "127.0.0.1");
    }

    #[test]
    fn test_command_line_without_port() {
        let config = ServerConfig::builder("/bin/sh", 9000)
            .pass_port(false)
            .args(["-c", "exit 0"])
            .wait_for_port(false)
            .build();

        assert_eq!(config.argv(), vec!["-c", "exit 0"]);
        assert_eq!(config.port(), 9000);
        assert!(!config.wait_for_port());
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::builder("ion-server", 8443)
            .env("OTEL_BSP_SCHEDULE_DELAY", "10")
            .build();

        assert_eq!(config.env().len(), 1);
        assert_eq!(config.env()[0].0, OsString::from("OTEL_BSP_SCHEDULE_DELAY"));
    }

    #[test]
    fn test_under_test_defaults() {
        let args = ServerArgs::under_test_defaults("/srv/static", "cert.pem", "key.pem");

        assert_eq!(
            args.as_slice(),
            &[
                "-s", "/static", "/srv/static",
                "-l", "trace",
                "--under-test",
                "--tls-cert-path", "cert.pem",
                "--tls-key-path", "key.pem",
            ]
        );
    }

    #[test]
    fn test_without_flag() {
        let args = ServerArgs::under_test_defaults("/srv/static", "cert.pem", "key.pem")
            .without("--under-test")
            .status_page();

        assert!(!args.as_slice().iter().any(|a| a == "--under-test"));
        assert_eq!(args.as_slice().last().map(String::as_str), Some("--status-page"));
    }

    #[test]
    fn test_server_args_into_config() {
        let config = ServerConfig::builder("ion-server", 8080)
            .server_args(ServerArgs::new().cleartext().under_test())
            .build();

        assert_eq!(config.argv(), vec!["-p", "8080", "--cleartext", "--under-test"]);
    }

    #[test]
    fn test_timeouts_default() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.startup_window, Duration::from_millis(100));
        assert_eq!(timeouts.port_wait, Duration::from_secs(5));
        assert_eq!(timeouts.graceful_stop, Duration::from_secs(5));
    }
}
