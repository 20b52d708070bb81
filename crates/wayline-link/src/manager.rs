use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use wayline_proto::{decode, encode, Command, Decoded, Event, LineFramer, ProtoError};

use crate::endpoint::{Connector, Endpoint};
use crate::error::LinkError;
use crate::store::LinkStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        })
    }
}

#[derive(Debug, Clone)]
pub enum ConnectMode {
    /// Open exactly this endpoint, typically picked by the operator.
    Explicit(Endpoint),
    /// Reuse the remembered endpoint if it is present right now.
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(Endpoint),
    AlreadyConnected(Endpoint),
    /// Nothing usable without asking the operator. Not an error.
    NoEndpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { bytes: usize },
    NotConnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(Event),
    Diagnostic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    ReadFailed,
    Closed,
    WriteFailed,
    Stale,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LossReason::ReadFailed => "read failed",
            LossReason::Closed => "closed by peer",
            LossReason::WriteFailed => "write failed",
            LossReason::Stale => "no traffic",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub reconnect_backoff: Duration,
    /// Quiet time after which a connected link is treated as lost.
    pub stale_after: Duration,
    pub health_every: Duration,
    pub write_timeout: Duration,
    pub teardown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(1),
            stale_after: Duration::from_secs(10),
            health_every: Duration::from_secs(1),
            write_timeout: Duration::from_secs(2),
            teardown_timeout: Duration::from_millis(500),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Request {
    Connect { mode: ConnectMode, reply: Reply<Result<ConnectOutcome, LinkError>> },
    Resume { reply: Reply<Result<ConnectOutcome, LinkError>> },
    Disconnect { reply: Reply<()> },
    Send { frame: Vec<u8>, what: &'static str, reply: Reply<Result<SendOutcome, LinkError>> },
    SetAutoReconnect { on: bool, reply: Reply<()> },
}

enum Signal {
    Activity { generation: u64 },
    Lost { generation: u64, reason: LossReason },
}

/// Handle to the operator-side link. Cloning is cheap; every clone talks to
/// the same supervisor task, which owns the port and serializes writes.
#[derive(Clone)]
pub struct ConnectionManager {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Starts the supervisor. Decoded vehicle traffic arrives on the returned
    /// receiver. The supervisor stops when the last handle is dropped.
    pub fn spawn<C: Connector>(
        connector: C,
        store: LinkStore,
        cfg: ManagerConfig,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (req_tx, req_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            connector,
            store,
            cfg,
            state: state_tx,
            inbound: inbound_tx,
            signals: sig_tx,
            session: None,
            generation: 0,
            reconnect_at: None,
        };
        tokio::spawn(supervisor.run(req_rx, sig_rx));

        (Self { requests: req_tx, state: state_rx }, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn connect(&self, mode: ConnectMode) -> Result<ConnectOutcome, LinkError> {
        self.request(|reply| Request::Connect { mode, reply }).await?
    }

    /// Startup path: silently reopen the remembered device, if any.
    pub async fn resume(&self) -> Result<ConnectOutcome, LinkError> {
        self.request(|reply| Request::Resume { reply }).await?
    }

    /// Drops the link, cancels any pending retry and forgets the device.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.request(|reply| Request::Disconnect { reply }).await
    }

    pub async fn set_auto_reconnect(&self, on: bool) -> Result<(), LinkError> {
        self.request(|reply| Request::SetAutoReconnect { on, reply }).await
    }

    /// Validates and encodes `cmd`, then queues it behind any other send.
    /// Nothing is written for a command that fails validation or exceeds
    /// the frame limit.
    pub async fn send(&self, cmd: &Command) -> Result<SendOutcome, LinkError> {
        if self.state() != ConnectionState::Connected {
            warn!("link: not connected, {} not sent", cmd.name());
            return Ok(SendOutcome::NotConnected);
        }
        cmd.validate().map_err(ProtoError::from)?;
        let frame = encode(cmd)?;
        let what = cmd.name();
        self.request(|reply| Request::Send { frame, what, reply }).await?
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(make(tx)).await.map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)
    }
}

struct Session<W> {
    endpoint: Endpoint,
    generation: u64,
    writer: W,
    reader: JoinHandle<()>,
    last_rx: Instant,
}

struct Supervisor<C: Connector> {
    connector: C,
    store: LinkStore,
    cfg: ManagerConfig,
    state: watch::Sender<ConnectionState>,
    inbound: mpsc::Sender<Inbound>,
    signals: mpsc::UnboundedSender<Signal>,
    session: Option<Session<WriteHalf<C::Stream>>>,
    /// Bumped on every open. Signals from older links are ignored, which
    /// keeps at most one loss (and so one retry) per link.
    generation: u64,
    reconnect_at: Option<Instant>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        let mut health = time::interval(self.cfg.health_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => self.on_request(req).await,
                    None => break,
                },
                Some(sig) = signals.recv() => self.on_signal(sig).await,
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.retry().await;
                }
                _ = health.tick() => self.check_health().await,
            }
        }

        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        debug!("link: supervisor stopped");
    }

    async fn on_request(&mut self, req: Request) {
        match req {
            Request::Connect { mode, reply } => {
                let _ = reply.send(self.connect(mode).await);
            }
            Request::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            Request::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Request::Send { frame, what, reply } => {
                let _ = reply.send(self.write(frame, what).await);
            }
            Request::SetAutoReconnect { on, reply } => {
                self.set_auto_reconnect(on);
                let _ = reply.send(());
            }
        }
    }

    async fn on_signal(&mut self, sig: Signal) {
        match sig {
            Signal::Activity { generation } => {
                if let Some(s) = self.session.as_mut().filter(|s| s.generation == generation) {
                    s.last_rx = Instant::now();
                }
            }
            Signal::Lost { generation, reason } => self.on_loss(generation, reason).await,
        }
    }

    async fn connect(&mut self, mode: ConnectMode) -> Result<ConnectOutcome, LinkError> {
        if let Some(current) = self.session.as_ref().map(|s| s.endpoint.clone()) {
            match &mode {
                ConnectMode::Explicit(ep) if !ep.same_device(&current) => {
                    info!("link: switching from {} to {}", current, ep);
                    self.teardown().await;
                    self.set_state(ConnectionState::Disconnected);
                }
                _ => return Ok(ConnectOutcome::AlreadyConnected(current)),
            }
        }
        self.reconnect_at = None;

        let endpoint = match mode {
            ConnectMode::Explicit(ep) => ep,
            ConnectMode::Silent => match self.find_known() {
                Ok(Some(ep)) => ep,
                Ok(None) => {
                    info!("link: no previously used device available");
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(ConnectOutcome::NoEndpoint);
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            },
        };

        self.set_state(ConnectionState::Connecting);
        match self.open(endpoint) {
            Ok(ep) => Ok(ConnectOutcome::Connected(ep)),
            Err(e) => {
                warn!("link: {}", e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn resume(&mut self) -> Result<ConnectOutcome, LinkError> {
        if !self.store.auto_reconnect() {
            info!("link: auto-reconnect off, not resuming");
            return Ok(ConnectOutcome::NoEndpoint);
        }
        self.connect(ConnectMode::Silent).await
    }

    /// The remembered device, matched against what is plugged in now so a
    /// renumbered USB adapter is still found.
    fn find_known(&self) -> Result<Option<Endpoint>, LinkError> {
        let Some(known) = self.store.last_device() else {
            return Ok(None);
        };
        let granted = self.connector.granted()?;
        Ok(granted.into_iter().find(|ep| ep.same_device(known)))
    }

    fn open(&mut self, endpoint: Endpoint) -> Result<Endpoint, LinkError> {
        let stream = self.connector.open(&endpoint)?;
        let (rd, writer) = tokio::io::split(stream);

        self.generation += 1;
        let generation = self.generation;
        let reader = tokio::spawn(read_loop(rd, generation, self.signals.clone(), self.inbound.clone()));

        if let Err(e) = self.store.remember(&endpoint) {
            warn!("link: could not remember {}: {:#}", endpoint, e);
        }
        info!("link: connected to {} (link #{})", endpoint, generation);
        self.session = Some(Session {
            endpoint: endpoint.clone(),
            generation,
            writer,
            reader,
            last_rx: Instant::now(),
        });
        self.set_state(ConnectionState::Connected);
        Ok(endpoint)
    }

    async fn on_loss(&mut self, generation: u64, reason: LossReason) {
        let Some(endpoint) = self
            .session
            .as_ref()
            .filter(|s| s.generation == generation)
            .map(|s| s.endpoint.clone())
        else {
            debug!("link: ignoring '{}' from old link #{}", reason, generation);
            return;
        };

        warn!("link: lost {} ({})", endpoint, reason);
        self.teardown().await;

        if self.store.auto_reconnect() {
            self.set_state(ConnectionState::Reconnecting);
            self.reconnect_at = Some(Instant::now() + self.cfg.reconnect_backoff);
            info!("link: retrying in {:?}", self.cfg.reconnect_backoff);
        } else {
            self.set_state(ConnectionState::Disconnected);
            info!("link: auto-reconnect off, staying disconnected");
        }
    }

    async fn retry(&mut self) {
        if self.session.is_some() {
            return;
        }
        match self.connect(ConnectMode::Silent).await {
            Ok(ConnectOutcome::Connected(ep)) => info!("link: reconnected to {}", ep),
            Ok(ConnectOutcome::NoEndpoint) => warn!("link: device did not come back"),
            Ok(ConnectOutcome::AlreadyConnected(_)) => {}
            Err(e) => warn!("link: reconnect failed: {}", e),
        }
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.teardown().await;
        if let Err(e) = self.store.forget() {
            warn!("link: could not clear remembered device: {:#}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("link: disconnected");
    }

    fn set_auto_reconnect(&mut self, on: bool) {
        if let Err(e) = self.store.set_auto_reconnect(on) {
            warn!("link: could not save auto-reconnect: {:#}", e);
        }
        if !on && self.reconnect_at.take().is_some() {
            self.set_state(ConnectionState::Disconnected);
        }
        info!("link: auto-reconnect {}", if on { "on" } else { "off" });
    }

    /// Best-effort release of the current link. Never fails and never waits
    /// longer than the teardown timeout per step.
    async fn teardown(&mut self) {
        let Some(mut s) = self.session.take() else {
            return;
        };

        s.reader.abort();
        match time::timeout(self.cfg.teardown_timeout, s.reader).await {
            Ok(Err(e)) if !e.is_cancelled() => warn!("link: reader task failed: {}", e),
            Err(_) => warn!("link: reader did not stop in time"),
            _ => {}
        }
        match time::timeout(self.cfg.teardown_timeout, s.writer.shutdown()).await {
            Ok(Err(e)) => debug!("link: writer shutdown: {}", e),
            Err(_) => warn!("link: writer shutdown timed out"),
            Ok(Ok(())) => {}
        }
        debug!("link: released {}", s.endpoint);
    }

    async fn write(&mut self, frame: Vec<u8>, what: &'static str) -> Result<SendOutcome, LinkError> {
        let limit = self.cfg.write_timeout;
        let Some(s) = self.session.as_mut() else {
            warn!("link: not connected, {} not sent", what);
            return Ok(SendOutcome::NotConnected);
        };
        let generation = s.generation;

        let res = time::timeout(limit, async {
            s.writer.write_all(&frame).await?;
            s.writer.flush().await
        })
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")));

        match res {
            Ok(()) => {
                debug!("link: sent {} ({} bytes)", what, frame.len());
                Ok(SendOutcome::Sent { bytes: frame.len() })
            }
            Err(e) => {
                warn!("link: sending {} failed: {}", what, e);
                self.on_loss(generation, LossReason::WriteFailed).await;
                Err(LinkError::Transport(e))
            }
        }
    }

    async fn check_health(&mut self) {
        let Some(s) = &self.session else {
            return;
        };
        let quiet = s.last_rx.elapsed();
        if quiet > self.cfg.stale_after {
            let generation = s.generation;
            warn!("link: nothing received for {}s", quiet.as_secs());
            self.on_loss(generation, LossReason::Stale).await;
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("link: {} -> {}", prev, next);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut rd: R,
    generation: u64,
    signals: mpsc::UnboundedSender<Signal>,
    inbound: mpsc::Sender<Inbound>,
) {
    let mut framer = LineFramer::default();
    let mut buf = [0u8; 512];

    let reason = loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => break LossReason::Closed,
            Ok(n) => n,
            Err(e) => {
                warn!("link: read: {}", e);
                break LossReason::ReadFailed;
            }
        };
        let lines = framer.accumulate(&buf[..n]);
        if lines.is_empty() {
            continue;
        }
        let _ = signals.send(Signal::Activity { generation });
        for line in lines {
            match line {
                Ok(line) => deliver(&line, &inbound),
                Err(e) => warn!("link: dropped frame: {}", e),
            }
        }
    };
    let _ = signals.send(Signal::Lost { generation, reason });
}

fn deliver(line: &str, inbound: &mpsc::Sender<Inbound>) {
    let item = match decode::<Event>(line) {
        Decoded::Message(ev) => Inbound::Event(ev),
        Decoded::Diagnostic(text) => {
            info!("vehicle: {}", text);
            Inbound::Diagnostic(text)
        }
        Decoded::UnknownKind(kind) => {
            warn!("link: unknown event type {:?}", kind);
            return;
        }
        Decoded::Unrecognized { line, reason } => {
            warn!("link: unrecognized line {:?}: {}", line, reason);
            return;
        }
    };
    match inbound.try_send(item) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => warn!("link: inbound queue full, dropping message"),
        Err(mpsc::error::TrySendError::Closed(_)) => debug!("link: inbound receiver gone, dropping message"),
    }
}
