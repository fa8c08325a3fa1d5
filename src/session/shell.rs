//! Interactive shell session.
//!
//! `connect` opens an SSH transport and a PTY shell channel, then hands both
//! to a reader [`Worker`] that owns them for the rest of the connection. The
//! session talks to the worker over an input queue; output flows straight
//! from the worker to the emitter as `data` envelopes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use russh::client::Msg;
use russh::keys::Algorithm;
use russh::{Channel, ChannelMsg};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{ConnectionSecurityOptions, Session, parse_payload, unknown_action};
use crate::config::CoreConfig;
use crate::envelope::Emitter;
use crate::error::{ConnectError, SessionError};
use crate::worker::{StopSignal, Worker};

fn default_port() -> u16 {
    22
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    24
}

/// Payload of the terminal `connect` action.
#[derive(Clone, Deserialize)]
pub struct ShellConnectRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Private key file; takes precedence over the password.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_rows")]
    pub rows: u32,
}

impl fmt::Debug for ShellConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellConnectRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl ShellConnectRequest {
    fn addr(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Debug, Deserialize)]
struct DataRequest {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    #[serde(default = "default_cols")]
    cols: u32,
    #[serde(default = "default_rows")]
    rows: u32,
}

/// Messages from the session to its reader worker.
#[derive(Debug)]
enum ShellInput {
    Data(String),
    Resize { cols: u32, rows: u32 },
    Close,
}

struct ShellHandle {
    input: mpsc::UnboundedSender<ShellInput>,
    worker: Worker,
}

/// A remote command line over one SSH channel.
pub struct InteractiveSession {
    emitter: Emitter,
    config: CoreConfig,
    active: Arc<AtomicBool>,
    shell: tokio::sync::Mutex<Option<ShellHandle>>,
}

impl InteractiveSession {
    pub fn new(emitter: Emitter, config: CoreConfig) -> Self {
        Self {
            emitter,
            config,
            active: Arc::new(AtomicBool::new(false)),
            shell: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn connect(&self, request: ShellConnectRequest) -> Result<(), SessionError> {
        let mut shell = self.shell.lock().await;
        if let Some(existing) = shell.take() {
            info!("{}: replacing existing shell", self.id());
            self.active.store(false, Ordering::Release);
            self.retire(existing).await;
        }

        let auth = auth_method(&request)?;
        let security = ConnectionSecurityOptions::from_level(self.config.security_level);
        let timeout = self.config.shell_connect_timeout();
        let (client, channel) = tokio::time::timeout(timeout, open_shell(&request, auth, &security))
            .await
            .map_err(|_| ConnectError::Timeout(timeout.as_secs()))?
            .inspect_err(|e| error!("{}: {} failed: {}", self.id(), request.addr(), e))?;
        info!("{}: shell open on {}", self.id(), request.addr());

        self.active.store(true, Ordering::Release);
        self.emitter.status("connected");

        let (input, inputs) = mpsc::unbounded_channel();
        let emitter = self.emitter.clone();
        let active = self.active.clone();
        let worker = Worker::spawn(format!("{}-reader", self.id()), move |stop| {
            read_loop(client, channel, inputs, emitter, active, stop)
        });
        *shell = Some(ShellHandle { input, worker });
        Ok(())
    }

    /// Writes `text` to the shell. Ignored while inactive.
    pub async fn handle_data(&self, text: String) {
        self.forward(ShellInput::Data(text)).await;
    }

    /// Renegotiates the terminal size. Ignored while inactive.
    pub async fn handle_resize(&self, cols: u32, rows: u32) {
        self.forward(ShellInput::Resize { cols, rows }).await;
    }

    async fn forward(&self, input: ShellInput) {
        if !self.is_active() {
            debug!("{}: ignoring {:?} while inactive", self.id(), input);
            return;
        }
        if let Some(shell) = self.shell.lock().await.as_ref()
            && shell.input.send(input).is_err()
        {
            debug!("{}: reader already gone", self.id());
        }
    }

    /// Closes the channel and transport and emits `disconnected`.
    ///
    /// A second call finds nothing to do and emits nothing.
    pub async fn disconnect(&self) {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        let existing = self.shell.lock().await.take();
        match existing {
            Some(handle) => {
                self.retire(handle).await;
                if was_active {
                    self.emitter.status("disconnected");
                } else {
                    debug!("{}: reaped reader of a closed shell", self.id());
                }
            }
            None if was_active => self.emitter.status("disconnected"),
            None => debug!("{}: disconnect while idle", self.id()),
        }
    }

    async fn retire(&self, handle: ShellHandle) {
        let _ = handle.input.send(ShellInput::Close);
        if !handle.worker.stop(self.config.worker_join_timeout()).await {
            warn!("{}: reader aborted during teardown", self.id());
        }
    }

    fn id(&self) -> &str {
        self.emitter.session_id()
    }
}

/// Picks key or password authentication for `request`.
fn auth_method(request: &ShellConnectRequest) -> Result<AuthMethod, ConnectError> {
    match &request.key_path {
        Some(path) => {
            check_key_file(path, request.passphrase.as_deref())?;
            Ok(AuthMethod::with_key_file(path, request.passphrase.as_deref()))
        }
        None => Ok(AuthMethod::with_password(
            request.password.as_deref().unwrap_or_default(),
        )),
    }
}

/// Loads the key once to make sure it is one of the supported types.
pub(crate) fn check_key_file(path: &Path, passphrase: Option<&str>) -> Result<(), ConnectError> {
    let key_error = |reason: String| ConnectError::KeyMaterial {
        path: path.display().to_string(),
        reason,
    };
    let key = russh::keys::load_secret_key(path, passphrase).map_err(|e| key_error(e.to_string()))?;
    match key.algorithm() {
        Algorithm::Rsa { .. } | Algorithm::Ed25519 | Algorithm::Ecdsa { .. } | Algorithm::Dsa => {
            Ok(())
        }
        other => Err(key_error(format!("unsupported key type {}", other))),
    }
}

async fn open_shell(
    request: &ShellConnectRequest,
    auth: AuthMethod,
    security: &ConnectionSecurityOptions,
) -> Result<(Client, Channel<Msg>), ConnectError> {
    let client = Client::connect_with_config(
        (request.host.clone(), request.port),
        &request.username,
        auth,
        security.server_check.clone(),
        security.client_config(None),
    )
    .await?;
    debug!("{} transport established", request.addr());

    let channel = client.get_channel().await?;
    channel
        .request_pty(false, "xterm", request.cols, request.rows, 0, 0, &[])
        .await?;
    channel.request_shell(false).await?;
    Ok((client, channel))
}

fn emit_output(emitter: &Emitter, data: &[u8]) {
    if !data.is_empty() {
        emitter.send("data", &json!({ "text": String::from_utf8_lossy(data) }));
    }
}

async fn read_loop(
    client: Client,
    mut channel: Channel<Msg>,
    mut inputs: mpsc::UnboundedReceiver<ShellInput>,
    emitter: Emitter,
    active: Arc<AtomicBool>,
    mut stop: StopSignal,
) {
    let id = emitter.session_id().to_string();
    loop {
        tokio::select! {
            _ = stop.requested() => break,
            input = inputs.recv() => match input {
                Some(ShellInput::Data(text)) => {
                    if let Err(e) = channel.data(text.as_bytes()).await {
                        error!("{}: write failed: {}", id, e);
                        emitter.error(format!("Failed to send data: {}", e));
                    }
                }
                Some(ShellInput::Resize { cols, rows }) => {
                    if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                        warn!("{}: resize to {}x{} failed: {}", id, cols, rows, e);
                    }
                }
                Some(ShellInput::Close) | None => break,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) => emit_output(&emitter, data),
                Some(ChannelMsg::ExtendedData { ref data, .. }) => emit_output(&emitter, data),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("{}: shell exited with {}", id, exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("{}: remote end closed the channel", id);
                    break;
                }
                Some(_) => {}
            },
        }
    }

    let _ = channel.close().await;
    if let Err(e) = client.disconnect().await {
        debug!("{}: transport close: {}", id, e);
    }
    reader_finished(&emitter, &active);
}

/// Marks the session inactive once its reader is gone.
///
/// Only a session that still believed itself active reports `disconnected`;
/// a reader stopped by `disconnect` finds the flag already cleared.
fn reader_finished(emitter: &Emitter, active: &AtomicBool) {
    let id = emitter.session_id();
    if active.swap(false, Ordering::AcqRel) {
        warn!("{}: shell ended unexpectedly", id);
        emitter.status("disconnected");
    }
    debug!("{}: reader finished", id);
}

#[async_trait]
impl Session for InteractiveSession {
    fn session_id(&self) -> &str {
        self.id()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn handle(&self, action: &str, payload: Value) -> Result<(), SessionError> {
        match action {
            "connect" => self.connect(parse_payload(payload)?).await,
            "disconnect" => {
                self.disconnect().await;
                Ok(())
            }
            "data" => {
                let request: DataRequest = parse_payload(payload)?;
                self.handle_data(request.text).await;
                Ok(())
            }
            "resize" => {
                let request: ResizeRequest = parse_payload(payload)?;
                self.handle_resize(request.cols, request.rows).await;
                Ok(())
            }
            other => Err(unknown_action(self.id(), other)),
        }
    }

    async fn shutdown(&self) {
        self.disconnect().await;
    }
}
