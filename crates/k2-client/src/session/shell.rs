//! Interactive CLI session over SSH

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use k2_core::{DeviceState, ImageDescriptor};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::parse::{parse_active_image, parse_system};
use super::DeviceSession;
use crate::error::{DeviceError, Result};
use crate::image::ReleaseServer;

static PASSWORD_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)password").expect("valid regex"));

static CONFIRM_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Please Confirm").expect("valid regex"));

/// Login and prompt settings for a [`ShellSession`]
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub user: String,
    /// Passed to ssh through `sshpass -e`; key-based login when `None`
    pub password: Option<String>,
    /// Password for `su`
    pub root_password: Option<String>,
    /// Regex matching the CLI prompt
    pub prompt: String,
    /// Longest wait for any single prompt
    pub timeout: Duration,
    /// Drop the host from `~/.ssh/known_hosts` before connecting
    pub reset_known_hosts: bool,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            user: "admin".to_string(),
            password: None,
            root_password: None,
            prompt: "SyncServer>".to_string(),
            timeout: Duration::from_secs(300),
            reset_known_hosts: true,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ShellIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    /// Output received but not yet consumed by a prompt match
    buffer: String,
    _child: Option<Child>,
}

/// Line-oriented session with the device CLI
///
/// A command is complete when the prompt pattern shows up again in the
/// output. Every wait is bounded by the session timeout.
pub struct ShellSession {
    host: String,
    prompt: Regex,
    timeout: Duration,
    root_password: Option<String>,
    io: Mutex<ShellIo>,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("host", &self.host)
            .field("prompt", &self.prompt.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ShellSession {
    /// Spawn `ssh -tt` to the device and wait for the first prompt
    #[instrument(skip(options), fields(user = %options.user))]
    pub async fn connect(host: &str, options: ShellOptions) -> Result<Self> {
        if options.reset_known_hosts {
            forget_host_key(host).await;
        }

        let target = format!("{}@{}", options.user, host);
        let ssh_args = ["-tt", "-o", "StrictHostKeyChecking=no", target.as_str()];

        let mut command = match &options.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg("ssh").args(ssh_args).env("SSHPASS", password);
                command
            }
            None => {
                let mut command = Command::new("ssh");
                command.args(ssh_args);
                command
            }
        };

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeviceError::ConnectionFailed(format!("failed to spawn ssh: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeviceError::Command("ssh stdout not captured".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeviceError::Command("ssh stdin not captured".to_string()))?;

        let session = Self::build(host, &options, Box::new(stdout), Box::new(stdin), Some(child))?;
        session.await_banner().await?;
        info!("Logged in to {} over ssh", host);
        Ok(session)
    }

    /// Run a session over an already-connected byte stream
    pub async fn from_stream<S>(host: &str, stream: S, options: ShellOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let session = Self::build(host, &options, Box::new(reader), Box::new(writer), None)?;
        session.await_banner().await?;
        Ok(session)
    }

    fn build(
        host: &str,
        options: &ShellOptions,
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
    ) -> Result<Self> {
        let prompt = Regex::new(&options.prompt)
            .map_err(|e| DeviceError::Command(format!("invalid prompt pattern: {}", e)))?;
        Ok(Self {
            host: host.to_string(),
            prompt,
            timeout: options.timeout,
            root_password: options.root_password.clone(),
            io: Mutex::new(ShellIo {
                reader,
                writer,
                buffer: String::new(),
                _child: child,
            }),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn await_banner(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        self.read_until(&mut io, &self.prompt).await.map(|_| ())
    }

    /// Send one line and wait for `pattern`, returning everything before it
    pub async fn exchange(&self, line: &str, pattern: &Regex) -> Result<String> {
        let mut io = self.io.lock().await;
        Self::write_line(&mut io, line).await?;
        self.read_until(&mut io, pattern).await
    }

    /// Send one line without waiting for any answer
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut io = self.io.lock().await;
        Self::write_line(&mut io, line).await
    }

    /// Run a CLI command and return its output without the echoed command
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn run_command(&self, command: &str) -> Result<String> {
        let raw = self.exchange(command, &self.prompt).await?;
        let output = strip_echo(&raw, command);
        debug!("{} -> {} bytes", command, output.len());
        Ok(output)
    }

    /// Become root with `su`
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn login_root(&self) -> Result<()> {
        let password = self
            .root_password
            .as_deref()
            .ok_or_else(|| DeviceError::Command("no root password configured".to_string()))?;
        self.exchange("su", &PASSWORD_PROMPT).await?;
        self.exchange(password, &self.prompt).await?;
        info!("Root shell open on {}", self.host);
        Ok(())
    }

    async fn write_line(io: &mut ShellIo, line: &str) -> Result<()> {
        io.writer.write_all(line.as_bytes()).await?;
        io.writer.write_all(b"\n").await?;
        io.writer.flush().await?;
        Ok(())
    }

    async fn read_until(&self, io: &mut ShellIo, pattern: &Regex) -> Result<String> {
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; 4096];

        loop {
            if let Some(found) = pattern.find(&io.buffer) {
                let (start, end) = (found.start(), found.end());
                let before = io.buffer[..start].to_string();
                io.buffer.drain(..end);
                return Ok(before);
            }

            match tokio::time::timeout_at(deadline, io.reader.read(&mut chunk)).await {
                Err(_) => {
                    warn!(
                        "No match for '{}' from {} within {:?}",
                        pattern.as_str(),
                        self.host,
                        self.timeout
                    );
                    return Err(DeviceError::Timeout);
                }
                Ok(Ok(0)) => {
                    return Err(DeviceError::ConnectionFailed(format!(
                        "shell to {} closed",
                        self.host
                    )))
                }
                Ok(Ok(n)) => io.buffer.push_str(&String::from_utf8_lossy(&chunk[..n])),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Output of a command with carriage returns and the echoed command line removed
fn strip_echo(raw: &str, command: &str) -> String {
    let text = raw.replace('\r', "");
    let mut lines = text.lines().peekable();
    if lines.peek().map(|first| first.trim() == command.trim()) == Some(true) {
        lines.next();
    }
    lines.collect::<Vec<_>>().join("\n").trim().to_string()
}

/// Drop a stale host key; devices regenerate theirs on every upgrade
async fn forget_host_key(host: &str) {
    let result = Command::new("ssh-keygen")
        .args(["-R", host])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!("ssh-keygen -R {} failed: {}", host, e);
    }
}

#[async_trait]
impl DeviceSession for ShellSession {
    /// Software version from `show system`, falling back to `show image`
    async fn get_state(&self) -> Result<DeviceState> {
        let system = parse_system(&self.run_command("show system").await?);
        let version = match system.software_version {
            Some(version) => Some(version),
            None => parse_active_image(&self.run_command("show image").await?),
        };

        let mut state = DeviceState::reachable();
        state.software_version = version;
        state.oscillator = system.oscillator;
        Ok(state)
    }

    /// The CLI has no sync state; a reported software version means it is back
    fn is_recovered(&self, state: &DeviceState) -> bool {
        state.software_version.is_some()
    }

    async fn send_command(&self, command: &str) -> Result<String> {
        self.run_command(command).await
    }

    /// Start `upgrade imagefilepath ... scp:<server>` on the device
    ///
    /// The device copies the files itself and reboots once the upgrade is
    /// confirmed, so nothing is awaited after the confirmation.
    #[instrument(skip(self, descriptor, server), fields(host = %self.host, image = %descriptor.name))]
    async fn pull_image(&self, descriptor: &ImageDescriptor, server: &ReleaseServer) -> Result<()> {
        let image = self.run_command("show image").await?;
        let active = parse_active_image(&image).ok_or_else(|| {
            DeviceError::Command(format!("{} did not report an active image", self.host))
        })?;
        info!("Active image on {} is {}", self.host, active);

        let command = format!(
            "upgrade imagefilepath {} authfilepath {} scp:{} {}",
            server.remote_path(&descriptor.folder, &descriptor.name),
            server.remote_path(&descriptor.folder, &descriptor.auth_name),
            server.host,
            server.user
        );
        self.exchange(&command, &PASSWORD_PROMPT).await?;
        self.exchange(server.password.as_deref().unwrap_or_default(), &CONFIRM_PROMPT)
            .await?;
        self.send_line("yes").await?;
        info!("Upgrade to {} confirmed on {}", descriptor.version, self.host);
        Ok(())
    }
}

/// State reader that logs in afresh for every read
///
/// Watches a device through a reboot, which cuts any long-lived shell.
#[derive(Debug, Clone)]
pub struct ShellProbe {
    host: String,
    options: ShellOptions,
}

impl ShellProbe {
    pub fn new(host: impl Into<String>, options: ShellOptions) -> Self {
        Self {
            host: host.into(),
            options,
        }
    }
}

#[async_trait]
impl DeviceSession for ShellProbe {
    async fn get_state(&self) -> Result<DeviceState> {
        let session = ShellSession::connect(&self.host, self.options.clone()).await?;
        session.get_state().await
    }

    fn is_recovered(&self, state: &DeviceState) -> bool {
        state.software_version.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeShell;
    use k2_core::ProductType;
    use pretty_assertions::assert_eq;

    fn options() -> ShellOptions {
        ShellOptions {
            root_password: Some("rootpw".into()),
            timeout: Duration::from_secs(2),
            ..ShellOptions::default()
        }
    }

    #[test]
    fn test_strip_echo() {
        assert_eq!(strip_echo("show alarm\r\nline 1\r\nline 2\r\n", "show alarm"), "line 1\nline 2");
        assert_eq!(strip_echo("no echo here\n", "show alarm"), "no echo here");
    }

    #[tokio::test]
    async fn test_run_command_returns_output_before_prompt() {
        let shell = FakeShell::new("SyncServer>")
            .on("show system", "Serial Num : 42\nBuild      : 5.1.2.7");
        let (stream, _) = shell.spawn();

        let session = ShellSession::from_stream("dut", stream, options()).await.unwrap();
        let output = session.run_command("show system").await.unwrap();
        assert_eq!(output, "Serial Num : 42\nBuild      : 5.1.2.7");

        let state = session.get_state().await.unwrap();
        assert_eq!(state.software_version.as_deref(), Some("5.1.2.7"));
    }

    #[tokio::test]
    async fn test_get_state_falls_back_to_show_image() {
        let shell = FakeShell::new("TimeProvider>")
            .on("show system", "Serial Num : 42")
            .on("show image", "Active Image Version : 2.3.1.12");
        let (stream, _) = shell.spawn();

        let session = ShellSession::from_stream(
            "dut",
            stream,
            ShellOptions {
                prompt: "TimeProvider>".into(),
                ..options()
            },
        )
        .await
        .unwrap();
        let state = session.get_state().await.unwrap();
        assert_eq!(state.software_version.as_deref(), Some("2.3.1.12"));
    }

    #[tokio::test]
    async fn test_missing_prompt_times_out() {
        let shell = FakeShell::new("SyncServer>").on_raw("hang", "no prompt follows");
        let (stream, _) = shell.spawn();

        let session = ShellSession::from_stream(
            "dut",
            stream,
            ShellOptions {
                timeout: Duration::from_millis(50),
                ..options()
            },
        )
        .await
        .unwrap();
        let err = session.run_command("hang").await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
    }

    #[tokio::test]
    async fn test_login_root_sends_su_and_password() {
        let shell = FakeShell::new("SyncServer>")
            .on_raw("su", "Password: ")
            .on("rootpw", "");
        let (stream, received) = shell.spawn();

        let session = ShellSession::from_stream("dut", stream, options()).await.unwrap();
        session.login_root().await.unwrap();
        assert_eq!(received.lock().clone(), vec!["su".to_string(), "rootpw".to_string()]);
    }

    #[tokio::test]
    async fn test_pull_image_answers_password_and_confirmation() {
        let shell = FakeShell::new("TimeProvider>")
            .on("show image", "Active Image Version : 2.3.1.12")
            .on_raw(
                "upgrade imagefilepath /builds/2021_09_14_sdk/TimeProvider4100_v2.4.0.bin \
                 authfilepath /builds/2021_09_14_sdk/2.4.0.1_auth.dat scp:10.0.0.5 builder",
                "builder@10.0.0.5's password: ",
            )
            .on_raw("buildpw", "Please Confirm (yes/no): ");
        let (stream, received) = shell.spawn();

        let session = ShellSession::from_stream(
            "dut",
            stream,
            ShellOptions {
                prompt: "TimeProvider>".into(),
                ..options()
            },
        )
        .await
        .unwrap();

        let descriptor = ImageDescriptor {
            product: ProductType::Tp4100,
            folder: "2021_09_14_sdk".into(),
            name: "TimeProvider4100_v2.4.0.bin".into(),
            auth_name: "2.4.0.1_auth.dat".into(),
            version: "2.4.0.1".into(),
        };
        let server = ReleaseServer {
            host: "10.0.0.5".into(),
            user: "builder".into(),
            password: Some("buildpw".into()),
            path: "/builds".into(),
        };
        session.pull_image(&descriptor, &server).await.unwrap();

        // the final "yes" is written without waiting for a reply
        tokio::time::sleep(Duration::from_millis(20)).await;
        let lines = received.lock().clone();
        assert_eq!(lines.last().map(String::as_str), Some("yes"));
        assert_eq!(lines.len(), 4);
    }
}
