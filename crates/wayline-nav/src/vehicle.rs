use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use wayline_proto::{codec, Command, Decoded, Event, LineFramer, SystemStatus, Telemetry};

use crate::gnss::{Fix, PositionSource};
use crate::mission::MissionController;

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    #[serde(default = "default_telemetry_ms")]
    pub telemetry_interval_ms: u64,
    #[serde(default = "default_status_ms")]
    pub status_interval_ms: u64,
}

/// Pause after the position source errors before polling it again.
const SOURCE_RETRY: Duration = Duration::from_secs(1);

fn default_telemetry_ms() -> u64 { 1000 }
fn default_status_ms() -> u64 { 5000 }

impl Default for VehicleConfig {
    fn default() -> Self {
        Self { telemetry_interval_ms: default_telemetry_ms(), status_interval_ms: default_status_ms() }
    }
}

/// Controller-side main loop: one task, no locks. Fixes, operator bytes and
/// the housekeeping tick are multiplexed with `select!`; every branch is
/// cancel-safe so nothing is lost when another branch wins.
pub struct Vehicle<P> {
    controller: MissionController,
    source: P,
    framer: LineFramer,
    telemetry_every: Duration,
    status_every: Duration,
    last_telemetry: Option<Instant>,
    last_status: Option<Instant>,
    last_valid_fix: Option<Instant>,
    source_retry_at: Option<Instant>,
}

impl<P: PositionSource> Vehicle<P> {
    pub fn new(source: P, cfg: &VehicleConfig) -> Self {
        Self {
            controller: MissionController::new(),
            source,
            framer: LineFramer::default(),
            telemetry_every: Duration::from_millis(cfg.telemetry_interval_ms),
            status_every: Duration::from_millis(cfg.status_interval_ms),
            last_telemetry: None,
            last_status: None,
            last_valid_fix: None,
            source_retry_at: None,
        }
    }

    pub fn controller(&self) -> &MissionController {
        &self.controller
    }

    /// Runs until the operator link reports end of stream. A failing
    /// position source is retried after a pause; it never ends the loop.
    pub async fn run<R, W>(&mut self, mut link_rx: R, mut link_tx: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("vehicle: ready");
        write_events(&mut link_tx, &[Event::status(SystemStatus::SystemReady)]).await;

        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut chunk = [0u8; 512];

        loop {
            let mut out = Vec::new();
            let poll_source = self.source_retry_at.map(|t| Instant::now() >= t).unwrap_or(true);
            tokio::select! {
                fix = self.source.next_fix(), if poll_source => match fix {
                    Ok(fix) => {
                        self.source_retry_at = None;
                        out.extend(self.on_fix(fix, Instant::now()));
                    }
                    Err(e) => {
                        warn!("vehicle: position source failed, retrying in {:?}: {:#}", SOURCE_RETRY, e);
                        self.source_retry_at = Some(Instant::now() + SOURCE_RETRY);
                    }
                },
                read = link_rx.read(&mut chunk) => {
                    let n = read.context("read operator link")?;
                    if n == 0 {
                        info!("vehicle: operator link closed");
                        return Ok(());
                    }
                    out.extend(self.on_bytes(&chunk[..n]));
                }
                _ = ticker.tick() => {}
            }
            out.extend(self.on_timers(Instant::now()));
            write_events(&mut link_tx, &out).await;
        }
    }

    fn on_fix(&mut self, fix: Fix, now: Instant) -> Vec<Event> {
        let mut out = self.controller.tick(&fix);
        if fix.valid {
            self.last_valid_fix = Some(now);
            if due(self.last_telemetry, self.telemetry_every, now) {
                self.last_telemetry = Some(now);
                out.push(telemetry(&fix));
            }
        }
        out
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Vec<Event> {
        let mut out = Vec::new();
        for frame in self.framer.accumulate(bytes) {
            let line = match frame {
                Ok(line) => line,
                Err(e) => {
                    warn!("vehicle: dropped frame: {}", e);
                    continue;
                }
            };
            match codec::decode::<Command>(&line) {
                Decoded::Message(cmd) => out.extend(self.controller.handle(cmd)),
                Decoded::UnknownKind(action) => {
                    warn!("vehicle: unknown command {:?}", action);
                    out.push(Event::status_with(SystemStatus::UnknownCommand, action));
                }
                Decoded::Diagnostic(text) => debug!("vehicle: operator text: {}", text),
                Decoded::Unrecognized { reason, .. } => warn!("vehicle: dropped malformed line: {}", reason),
            }
        }
        out
    }

    fn on_timers(&mut self, now: Instant) -> Vec<Event> {
        let fix_stale = self
            .last_valid_fix
            .map(|t| now.duration_since(t) > self.status_every)
            .unwrap_or(true);
        if fix_stale && due(self.last_status, self.status_every, now) {
            self.last_status = Some(now);
            return vec![Event::status(SystemStatus::WaitingGpsFix)];
        }
        Vec::new()
    }
}

fn due(last: Option<Instant>, every: Duration, now: Instant) -> bool {
    last.map(|t| now.duration_since(t) >= every).unwrap_or(true)
}

fn telemetry(fix: &Fix) -> Event {
    Event::Telemetry(Telemetry {
        lat: fix.lat,
        lng: fix.lng,
        alt: fix.alt,
        sat: fix.satellite_count,
        speed: fix.speed,
        hdop: fix.hdop,
        direction: fix.course,
        timestamp: fix.unix_ms(),
    })
}

/// The vehicle treats its link as always present: write failures are
/// logged and the loop carries on.
async fn write_events<W: AsyncWrite + Unpin>(tx: &mut W, events: &[Event]) {
    if events.is_empty() {
        return;
    }
    for ev in events {
        match codec::encode(ev) {
            Ok(bytes) => {
                if let Err(e) = tx.write_all(&bytes).await {
                    warn!("vehicle: link write failed: {}", e);
                    return;
                }
            }
            Err(e) => error!("vehicle: not sending event: {}", e),
        }
    }
    if let Err(e) = tx.flush().await {
        warn!("vehicle: link flush failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;
    use wayline_proto::{MissionPhase, MissionSpec, NavStatus, WaypointSpec};

    struct ChannelSource(mpsc::Receiver<Fix>);

    impl PositionSource for ChannelSource {
        async fn next_fix(&mut self) -> Result<Fix> {
            match self.0.recv().await {
                Some(fix) => Ok(fix),
                None => std::future::pending().await,
            }
        }
    }

    /// Fails the first `failures` reads, then forwards the channel.
    struct FlakySource {
        failures: usize,
        inner: ChannelSource,
    }

    impl PositionSource for FlakySource {
        async fn next_fix(&mut self) -> Result<Fix> {
            if self.failures > 0 {
                self.failures -= 1;
                anyhow::bail!("receiver unplugged");
            }
            self.inner.next_fix().await
        }
    }

    struct Operator {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        tx: WriteHalf<DuplexStream>,
    }

    impl Operator {
        async fn send(&mut self, cmd: &Command) {
            self.tx.write_all(&codec::encode(cmd).unwrap()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.tx.write_all(raw.as_bytes()).await.unwrap();
        }

        /// Next event that is not periodic housekeeping.
        async fn next(&mut self) -> Event {
            loop {
                let line = self.lines.next_line().await.unwrap().expect("link open");
                match codec::decode::<Event>(&line) {
                    Decoded::Message(Event::Telemetry(_)) => continue,
                    Decoded::Message(Event::Status { status: SystemStatus::WaitingGpsFix, .. }) => continue,
                    Decoded::Message(ev) => return ev,
                    other => panic!("vehicle sent {:?}", other),
                }
            }
        }

        /// Drains what the vehicle has written so far and counts the
        /// waiting-for-fix announcements among it.
        async fn waiting_for_fix(&mut self) -> usize {
            let mut n = 0;
            while let Ok(Ok(Some(line))) =
                tokio::time::timeout(Duration::from_millis(10), self.lines.next_line()).await
            {
                let v: serde_json::Value = serde_json::from_str(&line).unwrap();
                if v["status"] == "waiting_gps_fix" {
                    assert_eq!(v, serde_json::json!({"type": "status", "status": "waiting_gps_fix"}));
                    n += 1;
                }
            }
            n
        }
    }

    fn start() -> (Operator, mpsc::Sender<Fix>, tokio::task::JoinHandle<Result<()>>) {
        let (fix_tx, fix_rx) = mpsc::channel(8);
        let (op, handle) = start_with(ChannelSource(fix_rx));
        (op, fix_tx, handle)
    }

    fn start_with<P>(source: P) -> (Operator, tokio::task::JoinHandle<Result<()>>)
    where
        P: PositionSource + Send + 'static,
    {
        let (veh_end, op_end) = tokio::io::duplex(16 * 1024);
        let (vr, vw) = tokio::io::split(veh_end);
        let handle = tokio::spawn(async move {
            let mut v = Vehicle::new(source, &VehicleConfig::default());
            v.run(vr, vw).await
        });
        let (or, ow) = tokio::io::split(op_end);
        (Operator { lines: BufReader::new(or).lines(), tx: ow }, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn announces_ready_and_answers_status() {
        let (mut op, _fixes, handle) = start();
        assert_eq!(op.next().await, Event::status(SystemStatus::SystemReady));

        op.send(&Command::GetStatus).await;
        match op.next().await {
            Event::MissionStatus { mission_active, mission_state, current_waypoint, .. } => {
                assert!(!mission_active);
                assert_eq!(mission_state, MissionPhase::Idle);
                assert_eq!(current_waypoint, -1);
            }
            other => panic!("unexpected {:?}", other),
        }

        drop(op);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_and_malformed_commands() {
        let (mut op, _fixes, _handle) = start();
        op.next().await;

        op.send_raw("{\"action\":\"barrel_roll\"}\n").await;
        assert_eq!(
            op.next().await,
            Event::status_with(SystemStatus::UnknownCommand, "barrel_roll")
        );

        // malformed lines are dropped silently on the wire; the next good
        // command still works
        op.send_raw("{\"action\":\"start_mission\",\"waypoints\":7}\nnot json\n").await;
        op.send(&Command::EmergencyStop).await;
        assert_eq!(op.next().await, Event::status(SystemStatus::EmergencyStop));
    }

    #[tokio::test(start_paused = true)]
    async fn mission_runs_over_the_link() {
        let (mut op, fixes, _handle) = start();
        op.next().await;

        let spec = MissionSpec::new(vec![
            WaypointSpec::new("W1", 10.0, 10.0, 5.0),
            WaypointSpec::new("W2", 10.0001, 10.0001, 5.0),
        ]);
        op.send(&Command::StartMission(spec)).await;
        assert!(matches!(op.next().await, Event::MissionConfirmation { total_waypoints: 2, .. }));
        let Event::NavigationUpdate(u) = op.next().await else { panic!("expected nav update") };
        assert_eq!(u.status, NavStatus::NavigationStarted);

        fixes.send(Fix::new(10.0, 10.0, 5.0)).await.unwrap();
        let Event::NavigationUpdate(u) = op.next().await else { panic!() };
        assert_eq!((u.status, u.current_waypoint_index), (NavStatus::WaypointReached, 0));
        let Event::NavigationUpdate(u) = op.next().await else { panic!() };
        assert_eq!((u.status, u.current_waypoint_index), (NavStatus::NavigatingTo, 1));

        fixes.send(Fix::new(10.0001, 10.0001, 5.0)).await.unwrap();
        let Event::NavigationUpdate(u) = op.next().await else { panic!() };
        assert_eq!((u.status, u.current_waypoint_index), (NavStatus::WaypointReached, 1));
        let Event::NavigationUpdate(u) = op.next().await else { panic!() };
        assert_eq!(u.status, NavStatus::MissionComplete);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_is_rate_limited() {
        let (veh_end, op_end) = tokio::io::duplex(16 * 1024);
        let (fix_tx, fix_rx) = mpsc::channel(16);
        let (vr, vw) = tokio::io::split(veh_end);
        tokio::spawn(async move {
            let mut v = Vehicle::new(ChannelSource(fix_rx), &VehicleConfig::default());
            v.run(vr, vw).await
        });

        for _ in 0..5 {
            fix_tx.send(Fix::new(1.0, 2.0, 3.0)).await.unwrap();
        }
        // let the loop drain the queued fixes without advancing past 1s
        tokio::time::sleep(Duration::from_millis(50)).await;
        fix_tx.send(Fix::new(1.0, 2.0, 3.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        fix_tx.send(Fix::new(1.0, 2.0, 3.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (or, _ow) = tokio::io::split(op_end);
        let mut lines = BufReader::new(or).lines();
        let mut telemetry = 0;
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(Duration::from_millis(10), lines.next_line()).await
        {
            if let Decoded::Message(Event::Telemetry(t)) = codec::decode::<Event>(&line) {
                assert_eq!((t.lat, t.lng, t.sat), (1.0, 2.0, 9));
                telemetry += 1;
            }
        }
        assert_eq!(telemetry, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_fix_is_announced_every_status_interval() {
        let (mut op, fixes, _handle) = start();

        // no fix at all: at start, then every 5s
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(op.waiting_for_fix().await, 1);
        tokio::time::sleep(Duration::from_millis(7_600)).await;
        assert_eq!(op.waiting_for_fix().await, 2);

        // a valid fix silences it for the next 5s
        fixes.send(Fix::new(1.0, 2.0, 3.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(4_800)).await;
        assert_eq!(op.waiting_for_fix().await, 0);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(op.waiting_for_fix().await, 1);

        // an invalid fix does not count as hearing from the receiver
        fixes.send(Fix { valid: false, ..Fix::new(1.0, 2.0, 3.0) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(op.waiting_for_fix().await, 0);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(op.waiting_for_fix().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn position_source_error_is_retried() {
        let (fix_tx, fix_rx) = mpsc::channel(8);
        let source = FlakySource { failures: 1, inner: ChannelSource(fix_rx) };
        let (mut op, handle) = start_with(source);
        assert_eq!(op.next().await, Event::status(SystemStatus::SystemReady));

        op.send(&Command::GetStatus).await;
        assert!(matches!(op.next().await, Event::MissionStatus { .. }));

        // the source is polled again after the pause and its fixes flow
        fix_tx.send(Fix::new(1.0, 2.0, 3.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let mut telemetry = 0;
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(Duration::from_millis(10), op.lines.next_line()).await
        {
            if let Decoded::Message(Event::Telemetry(t)) = codec::decode::<Event>(&line) {
                assert_eq!((t.lat, t.lng), (1.0, 2.0));
                telemetry += 1;
            }
        }
        assert_eq!(telemetry, 1);
        assert!(!handle.is_finished());
    }
}
