//! In-memory SSH and SFTP doubles for hub tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio_util::sync::PollSemaphore;

use tl_core::config::CoreConfig;
use tl_core::error::{AgentError, ChannelError, SftpError, TransportError};
use tl_core::traits::{
    BoxedStream, ChannelControl, ChannelInput, ChannelRequest, Connector, HostTarget, KeyAgent,
    KeyboardInteractiveReply, LinkChannel, RemoteFs, RemoteFsFactory, RemoteReader, RemoteStat,
    RemoteWriter, SshLink, StreamRequest,
};
use tl_protocol::{AgentKeyInfo, CoreEvent, FileRecord, Prompt, TerminalSize};
use tl_session::{AgentManager, SessionHub};

/// How a fake host behaves
#[derive(Debug, Clone, Default)]
pub struct HostScript {
    /// Accepted password
    pub password: Option<String>,
    /// Keyboard-interactive prompts and the answers that pass them
    pub kbi: Option<(Vec<Prompt>, Vec<String>)>,
    /// Refuse TCP connections
    pub unreachable: bool,
    /// Agent key (by id) the host accepts
    pub agent_key: Option<String>,
    /// Connection drops as soon as authentication starts
    pub drops_during_auth: bool,
}

impl HostScript {
    pub fn password(password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..Default::default()
        }
    }

    pub fn otp(prompt: &str, code: &str) -> Self {
        Self {
            kbi: Some((vec![Prompt::new(prompt, false)], vec![code.to_string()])),
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    pub fn agent(key_id: &str) -> Self {
        Self {
            agent_key: Some(key_id.to_string()),
            ..Default::default()
        }
    }

    pub fn drops_during_auth() -> Self {
        Self {
            password: Some("pw".to_string()),
            drops_during_auth: true,
            ..Default::default()
        }
    }
}

/// Observable state of one fake connection
#[derive(Debug)]
pub struct LinkState {
    pub host: String,
    pub tunneled: bool,
    closed: AtomicBool,
    resizes: Mutex<Vec<TerminalSize>>,
    shells: AtomicUsize,
}

impl LinkState {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop the "socket" without telling anyone
    pub fn sever(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.resizes.lock().unwrap().clone()
    }

    /// Shell channels opened on this connection
    pub fn shells_opened(&self) -> usize {
        self.shells.load(Ordering::SeqCst)
    }
}

/// Connector over scripted hosts
#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<HashMap<String, HostScript>>,
    links: Mutex<Vec<Arc<LinkState>>>,
    agent: Option<Arc<FakeAgent>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, script: HostScript) -> Self {
        self.hosts.lock().unwrap().insert(host.to_string(), script);
        self
    }

    /// Agent the fake links consult for agent authentication
    pub fn with_agent(mut self, agent: Arc<FakeAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Change how a host behaves for later connections
    pub fn set_host(&self, host: &str, script: HostScript) {
        self.hosts.lock().unwrap().insert(host.to_string(), script);
    }

    /// Every connection made, in order
    pub fn links(&self) -> Vec<Arc<LinkState>> {
        self.links.lock().unwrap().clone()
    }

    /// Connections made to `host`, in order
    pub fn links_to(&self, host: &str) -> Vec<Arc<LinkState>> {
        self.links()
            .into_iter()
            .filter(|l| l.host == host)
            .collect()
    }

    fn open(
        &self,
        target: &HostTarget,
        stream: Option<BoxedStream>,
    ) -> Result<Box<dyn SshLink>, TransportError> {
        let script = self.hosts.lock().unwrap().get(&target.host).cloned();
        let script = match script {
            Some(script) if !script.unreachable => script,
            _ => {
                return Err(TransportError::NetworkUnreachable(format!(
                    "{}: connection refused",
                    target.address()
                )))
            }
        };

        let state = Arc::new(LinkState {
            host: target.host.clone(),
            tunneled: stream.is_some(),
            closed: AtomicBool::new(false),
            resizes: Mutex::new(Vec::new()),
            shells: AtomicUsize::new(0),
        });
        self.links.lock().unwrap().push(state.clone());

        Ok(Box::new(FakeLink {
            state,
            script,
            agent: self.agent.clone(),
            _tunnel: Mutex::new(stream),
        }))
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &HostTarget) -> Result<Box<dyn SshLink>, TransportError> {
        self.open(target, None)
    }

    async fn connect_over(
        &self,
        stream: BoxedStream,
        target: &HostTarget,
    ) -> Result<Box<dyn SshLink>, TransportError> {
        self.open(target, Some(stream))
    }
}

struct FakeLink {
    state: Arc<LinkState>,
    script: HostScript,
    agent: Option<Arc<FakeAgent>>,
    _tunnel: Mutex<Option<BoxedStream>>,
}

impl FakeLink {
    fn check_alive(&self) -> Result<(), TransportError> {
        if self.script.drops_during_auth {
            self.state.sever();
            return Err(TransportError::NetworkUnreachable(
                "connection reset during authentication".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SshLink for FakeLink {
    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<bool, TransportError> {
        self.check_alive()?;
        Ok(self.script.password.as_deref() == Some(password))
    }

    async fn auth_agent(&mut self, _user: &str, _socket: &Path) -> Result<bool, TransportError> {
        self.check_alive()?;
        let (Some(agent), Some(wanted)) = (&self.agent, &self.script.agent_key) else {
            return Ok(false);
        };
        Ok(agent.holds(wanted))
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _private_key: &str,
        _passphrase: Option<&str>,
    ) -> Result<bool, TransportError> {
        self.check_alive()?;
        Ok(false)
    }

    async fn auth_keyboard_interactive_start(
        &mut self,
        _user: &str,
    ) -> Result<KeyboardInteractiveReply, TransportError> {
        self.check_alive()?;
        Ok(match &self.script.kbi {
            Some((prompts, _)) => KeyboardInteractiveReply::Prompts {
                name: "Two-factor".to_string(),
                instructions: String::new(),
                prompts: prompts.clone(),
            },
            None => KeyboardInteractiveReply::Failure,
        })
    }

    async fn auth_keyboard_interactive_respond(
        &mut self,
        answers: Vec<String>,
    ) -> Result<KeyboardInteractiveReply, TransportError> {
        Ok(match &self.script.kbi {
            Some((_, expected)) if *expected == answers => KeyboardInteractiveReply::Success,
            _ => KeyboardInteractiveReply::Failure,
        })
    }

    async fn open_channel(&self, request: ChannelRequest) -> Result<LinkChannel, TransportError> {
        if self.state.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(match request {
            ChannelRequest::Shell { .. } => {
                self.state.shells.fetch_add(1, Ordering::SeqCst);
                // Give concurrent openers a chance to interleave.
                tokio::task::yield_now().await;
                echo_shell(self.state.clone())
            }
            ChannelRequest::Exec { command } => exec_channel(command),
        })
    }

    async fn open_stream(&self, _request: StreamRequest) -> Result<BoxedStream, TransportError> {
        if self.state.is_closed() {
            return Err(TransportError::Closed);
        }
        let (near, _far) = tokio::io::duplex(64 * 1024);
        Ok(Box::new(near))
    }

    async fn disconnect(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

/// Shell that echoes every write back as output
fn echo_shell(state: Arc<LinkState>) -> LinkChannel {
    let (tx, rx) = mpsc::channel(64);
    LinkChannel {
        inbound: rx,
        control: Arc::new(EchoControl {
            tx: Mutex::new(Some(tx)),
            state,
        }),
    }
}

struct EchoControl {
    tx: Mutex<Option<mpsc::Sender<ChannelInput>>>,
    state: Arc<LinkState>,
}

#[async_trait]
impl ChannelControl for EchoControl {
    async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(ChannelInput::Data(data))
                .await
                .map_err(|_| ChannelError::Closed("echo".to_string())),
            None => Err(ChannelError::Closed("echo".to_string())),
        }
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), ChannelError> {
        self.state.resizes.lock().unwrap().push(size);
        Ok(())
    }

    async fn eof(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.tx.lock().unwrap().take();
        Ok(())
    }
}

/// `fail ...` commands print to stderr and exit 1; others echo the command
fn exec_channel(command: String) -> LinkChannel {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        if command.starts_with("fail") {
            let _ = tx.send(ChannelInput::Stderr(Bytes::from("boom\n"))).await;
            let _ = tx.send(ChannelInput::ExitStatus(1)).await;
        } else {
            let out = format!("{}\n", command);
            let _ = tx.send(ChannelInput::Data(Bytes::from(out))).await;
            let _ = tx.send(ChannelInput::ExitStatus(0)).await;
        }
        let _ = tx.send(ChannelInput::Eof).await;
    });
    LinkChannel {
        inbound: rx,
        control: Arc::new(NullControl),
    }
}

struct NullControl;

#[async_trait]
impl ChannelControl for NullControl {
    async fn write(&self, _data: Bytes) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn resize(&self, _size: TerminalSize) -> Result<(), ChannelError> {
        Err(ChannelError::NotAPty("exec".to_string()))
    }

    async fn eof(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// SFTP "server" backed by a local directory
pub struct FakeFsFactory {
    root: PathBuf,
    /// When set, every remote write needs one permit
    gate: Option<Arc<Semaphore>>,
}

impl FakeFsFactory {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            gate: None,
        }
    }

    pub fn gated(root: &Path, gate: Arc<Semaphore>) -> Self {
        Self {
            root: root.to_path_buf(),
            gate: Some(gate),
        }
    }
}

#[async_trait]
impl RemoteFsFactory for FakeFsFactory {
    async fn open(&self, _stream: BoxedStream) -> Result<Arc<dyn RemoteFs>, SftpError> {
        Ok(Arc::new(FakeFs {
            root: self.root.clone(),
            gate: self.gate.clone(),
        }))
    }
}

struct FakeFs {
    root: PathBuf,
    gate: Option<Arc<Semaphore>>,
}

impl FakeFs {
    fn local(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn fs_error(path: &str, e: io::Error) -> SftpError {
    match e.kind() {
        io::ErrorKind::NotFound => SftpError::PathNotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
        _ => SftpError::Remote(e.to_string()),
    }
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

#[async_trait]
impl RemoteFs for FakeFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileRecord>, SftpError> {
        let mut entries = tokio::fs::read_dir(self.local(path))
            .await
            .map_err(|e| fs_error(path, e))?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| fs_error(path, e))? {
            let meta = entry.metadata().await.map_err(|e| fs_error(path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            records.push(FileRecord {
                path: format!("{}/{}", path.trim_end_matches('/'), name),
                name,
                is_dir: meta.is_dir(),
                mode: mode_of(&meta),
                is_link: meta.file_type().is_symlink(),
                mod_time: None,
                size: meta.len(),
            });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn stat(&self, path: &str) -> Result<RemoteStat, SftpError> {
        let meta = tokio::fs::metadata(self.local(path))
            .await
            .map_err(|e| fs_error(path, e))?;
        Ok(RemoteStat {
            is_dir: meta.is_dir(),
            is_link: false,
            size: meta.len(),
            mode: mode_of(&meta),
        })
    }

    async fn lstat(&self, path: &str) -> Result<RemoteStat, SftpError> {
        let meta = tokio::fs::symlink_metadata(self.local(path))
            .await
            .map_err(|e| fs_error(path, e))?;
        Ok(RemoteStat {
            is_dir: meta.is_dir(),
            is_link: meta.file_type().is_symlink(),
            size: meta.len(),
            mode: mode_of(&meta),
        })
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = tokio::fs::File::open(self.local(path))
            .await
            .map_err(|e| fs_error(path, e))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = tokio::fs::File::create(self.local(path))
            .await
            .map_err(|e| fs_error(path, e))?;
        Ok(match &self.gate {
            Some(gate) => Box::new(GatedWriter {
                inner: file,
                gate: PollSemaphore::new(gate.clone()),
                admitted: false,
            }),
            None => Box::new(file),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        tokio::fs::create_dir(self.local(path))
            .await
            .map_err(|e| fs_error(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        tokio::fs::rename(self.local(from), self.local(to))
            .await
            .map_err(|e| fs_error(from, e))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        tokio::fs::remove_file(self.local(path))
            .await
            .map_err(|e| fs_error(path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        tokio::fs::remove_dir(self.local(path))
            .await
            .map_err(|e| fs_error(path, e))
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(self.local(path), std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| fs_error(path, e))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            Ok(())
        }
    }

    async fn close(&self) -> Result<(), SftpError> {
        Ok(())
    }
}

/// Writer that takes one permit from a semaphore per accepted write
struct GatedWriter {
    inner: tokio::fs::File,
    gate: PollSemaphore,
    admitted: bool,
}

impl AsyncWrite for GatedWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.admitted {
            match ready!(self.gate.poll_acquire(cx)) {
                Some(permit) => permit.forget(),
                None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            }
            self.admitted = true;
        }
        let written = ready!(Pin::new(&mut self.inner).poll_write(cx, buf));
        self.admitted = false;
        Poll::Ready(written)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// In-memory agent; a key's id is `SHA256:` plus the key text
#[derive(Default)]
pub struct FakeAgent {
    keys: Mutex<Vec<AgentKeyInfo>>,
}

impl FakeAgent {
    pub fn holds(&self, key_id: &str) -> bool {
        self.keys.lock().unwrap().iter().any(|k| k.key_id == key_id)
    }
}

#[async_trait]
impl KeyAgent for FakeAgent {
    fn socket(&self) -> Result<PathBuf, AgentError> {
        Ok(PathBuf::from("/fake/agent.sock"))
    }

    async fn list_keys(&self) -> Result<Vec<AgentKeyInfo>, AgentError> {
        Ok(self.keys.lock().unwrap().clone())
    }

    async fn add_key(
        &self,
        private_key: &str,
        _passphrase: Option<&str>,
        comment: Option<&str>,
    ) -> Result<AgentKeyInfo, AgentError> {
        if private_key.is_empty() {
            return Err(AgentError::InvalidKey("empty key".to_string()));
        }
        let info = AgentKeyInfo {
            key_id: format!("SHA256:{}", private_key),
            algorithm: "ssh-ed25519".to_string(),
            comment: comment.unwrap_or_default().to_string(),
        };
        self.keys.lock().unwrap().push(info.clone());
        Ok(info)
    }

    async fn remove_key(&self, key_id: &str) -> Result<(), AgentError> {
        let mut keys = self.keys.lock().unwrap();
        let before = keys.len();
        keys.retain(|k| k.key_id != key_id);
        if keys.len() == before {
            return Err(AgentError::KeyNotFound(key_id.to_string()));
        }
        Ok(())
    }
}

/// Settings that keep tests quick
pub fn test_config() -> CoreConfig {
    CoreConfig {
        health_check_interval: Duration::from_millis(20),
        progress_interval: Duration::ZERO,
        transfer_chunk_size: 32 * 1024,
        ..CoreConfig::default()
    }
}

/// Hub over the given fakes
pub fn hub(connector: FakeConnector, fs: FakeFsFactory) -> (SessionHub, Arc<FakeConnector>) {
    let connector = Arc::new(connector);
    let hub = SessionHub::new(test_config(), connector.clone(), Arc::new(fs));
    (hub, connector)
}

/// Hub whose SSH agent is `agent`
pub fn hub_with_agent(
    connector: FakeConnector,
    agent: Arc<FakeAgent>,
    enabled: bool,
) -> (SessionHub, Arc<FakeConnector>) {
    let connector = Arc::new(connector.with_agent(agent.clone()));
    let hub = SessionHub::with_agent(
        test_config(),
        connector.clone(),
        Arc::new(FakeFsFactory::new(Path::new("/nonexistent"))),
        AgentManager::new(agent, enabled),
    );
    (hub, connector)
}

/// Wait for the first event matching `pred`
pub async fn wait_for<F>(
    rx: &mut broadcast::Receiver<CoreEvent>,
    within: Duration,
    mut pred: F,
) -> CoreEvent
where
    F: FnMut(&CoreEvent) -> bool,
{
    let search = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    };
    tokio::time::timeout(within, search)
        .await
        .expect("timed out waiting for event")
}
