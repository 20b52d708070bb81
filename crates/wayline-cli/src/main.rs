use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines, Stdin};
use tracing::{info, warn};

use wayline_link::{
    doctor as link_doctor, ConnectMode, ConnectOutcome, ConnectionManager, ConnectionState, Connector,
    Endpoint, Inbound, LinkConfig, LinkStore, ManagerConfig, SendOutcome, SerialConnector,
};
use wayline_nav::{doctor as nav_doctor, geo, GnssSource, PositionSource, Vehicle, VehicleConfig};
use wayline_proto::{Command as Wire, Event, MissionSpec};

#[derive(Debug, Parser)]
#[command(name = "wayline", version, about = "Wayline - waypoint missions over a serial link")]
struct Cli {
    /// TOML config; built-in defaults when omitted.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    /// Run the vehicle controller on the configured GNSS source.
    Vehicle,
    /// Operator console: connect to a vehicle and send missions.
    Operator {
        #[arg(long)]
        port: Option<String>,
    },
    Mission { #[command(subcommand)] cmd: MissionCmd },
    /// List serial ports.
    Ports,
}

#[derive(Debug, Subcommand)]
enum MissionCmd {
    /// Validate a mission plan and print its legs.
    Check { file: String },
}

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    link: LinkConfig,
    #[serde(default)]
    gnss: GnssCfg,
    #[serde(default)]
    vehicle: VehicleCfg,
}

#[derive(Debug, Deserialize)]
struct GnssCfg {
    #[serde(default = "default_gnss_source")]
    source: String,
    nmea_device: Option<String>,
    nmea_file: Option<String>,
    #[serde(default = "default_gnss_baud")]
    baud: u32,
    #[serde(default = "default_replay_pace_ms")]
    replay_pace_ms: u64,
}

fn default_gnss_source() -> String { "nmea-serial".into() }
fn default_gnss_baud() -> u32 { 9600 }
fn default_replay_pace_ms() -> u64 { 1000 }

impl Default for GnssCfg {
    fn default() -> Self {
        Self {
            source: default_gnss_source(),
            nmea_device: None,
            nmea_file: None,
            baud: default_gnss_baud(),
            replay_pace_ms: default_replay_pace_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VehicleCfg {
    /// Serial port towards the operator; stdin/stdout when absent.
    port: Option<String>,
    #[serde(default = "default_vehicle_baud")]
    baud: u32,
    #[serde(flatten)]
    timing: VehicleConfig,
}

fn default_vehicle_baud() -> u32 { 115_200 }

impl Default for VehicleCfg {
    fn default() -> Self {
        Self { port: None, baud: default_vehicle_baud(), timing: VehicleConfig::default() }
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(path) = path else { return Ok(Config::default()); };
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

fn load_plan(path: &str) -> Result<MissionSpec> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read mission {}", path))?;
    toml::from_str(&s).with_context(|| format!("parse mission {}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Vehicle => vehicle(&cfg).await?,
        Command::Operator { port } => operator(&cfg, port).await?,
        Command::Mission { cmd: MissionCmd::Check { file } } => mission_check(&file)?,
        Command::Ports => ports(&cfg)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    link_doctor::check_link(&cfg.link)?;
    nav_doctor::check_gnss_source(
        &cfg.gnss.source,
        cfg.gnss.nmea_device.as_deref(),
        cfg.gnss.nmea_file.as_deref(),
        cfg.gnss.baud,
    )?;
    nav_doctor::check_vehicle(&cfg.vehicle.timing)?;
    if let Some(port) = &cfg.vehicle.port {
        anyhow::ensure!(!port.is_empty(), "vehicle.port is empty");
    }
    info!("doctor: OK");
    Ok(())
}

fn mission_check(file: &str) -> Result<()> {
    let spec = load_plan(file)?;
    nav_doctor::check_mission(&spec)?;

    let points: Vec<(f64, f64)> = spec
        .waypoints
        .iter()
        .map(|w| (w.latitude.unwrap_or_default(), w.longitude.unwrap_or_default()))
        .collect();
    for (i, leg) in points.windows(2).enumerate() {
        let (a, b) = (leg[0], leg[1]);
        println!(
            "{:>2} -> {:<2} {:>9.1} m  bearing {:>5.1}",
            i,
            i + 1,
            geo::haversine_m(a.0, a.1, b.0, b.1),
            geo::bearing_deg(a.0, a.1, b.0, b.1),
        );
    }
    println!(
        "{} waypoints, {:.1} m, max_speed {} m/s, max_altitude {} m, return_to_home {}",
        spec.waypoints.len(),
        geo::path_length_m(&points),
        spec.max_speed,
        spec.max_altitude,
        spec.return_to_home,
    );
    Ok(())
}

fn ports(cfg: &Config) -> Result<()> {
    let found = SerialConnector::new(cfg.link.baud).granted()?;
    if found.is_empty() {
        println!("no serial ports");
    }
    for (i, ep) in found.iter().enumerate() {
        println!("[{}] {}", i, ep);
    }
    Ok(())
}

// ----- vehicle -----

async fn vehicle(cfg: &Config) -> Result<()> {
    let gnss = &cfg.gnss;
    match gnss.source.as_str() {
        "nmea-serial" => {
            let dev = gnss.nmea_device.as_deref().context("gnss.nmea_device missing")?;
            drive(GnssSource::serial(dev, gnss.baud)?, cfg).await
        }
        "nmea-file" => {
            let file = gnss.nmea_file.as_deref().context("gnss.nmea_file missing")?;
            let pace = Duration::from_millis(gnss.replay_pace_ms);
            drive(GnssSource::file(file, pace)?, cfg).await
        }
        other => anyhow::bail!("unknown gnss.source: {}", other),
    }
}

async fn drive<P: PositionSource>(source: P, cfg: &Config) -> Result<()> {
    let mut v = Vehicle::new(source, &cfg.vehicle.timing);
    match &cfg.vehicle.port {
        Some(port) => {
            let baud = cfg.vehicle.baud;
            let stream = SerialConnector::new(baud).open(&Endpoint::new(port.as_str()))?;
            info!("vehicle: operator link on {} @ {}", port, baud);
            let (rx, tx) = tokio::io::split(stream);
            serve(&mut v, rx, tx).await
        }
        None => {
            info!("vehicle: operator link on stdio");
            serve(&mut v, tokio::io::stdin(), tokio::io::stdout()).await
        }
    }
}

async fn serve<P, R, W>(v: &mut Vehicle<P>, rx: R, tx: W) -> Result<()>
where
    P: PositionSource,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        res = v.run(rx, tx) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("vehicle: interrupted");
            Ok(())
        }
    }
}

// ----- operator -----

#[derive(Debug, PartialEq)]
enum Console {
    Upload(String),
    Status,
    Stop,
    Home,
    Auto(bool),
    Reconnect,
    Disconnect,
    Quit,
}

fn parse_console(line: &str) -> Result<Option<Console>, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else { return Ok(None) };
    let arg = words.next();
    let c = match (cmd, arg) {
        ("upload", Some(file)) => Console::Upload(file.to_owned()),
        ("upload", None) => return Err("usage: upload <mission.toml>".into()),
        ("status", _) => Console::Status,
        ("stop", _) => Console::Stop,
        ("home", _) => Console::Home,
        ("auto", Some("on")) => Console::Auto(true),
        ("auto", Some("off")) => Console::Auto(false),
        ("auto", _) => return Err("usage: auto on|off".into()),
        ("reconnect", _) => Console::Reconnect,
        ("disconnect", _) => Console::Disconnect,
        ("quit" | "exit", _) => Console::Quit,
        (other, _) => return Err(format!("unknown command: {}", other)),
    };
    Ok(Some(c))
}

type Input = Lines<BufReader<Stdin>>;

async fn operator(cfg: &Config, port: Option<String>) -> Result<()> {
    let connector = SerialConnector::new(cfg.link.baud);
    let store = LinkStore::open(&cfg.link.state_file);
    let (mgr, inbound) = ConnectionManager::spawn(connector.clone(), store, ManagerConfig::from(&cfg.link));
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    tokio::spawn(print_inbound(inbound));
    tokio::spawn(print_state(mgr.clone()));

    match port.or_else(|| cfg.link.port.clone()) {
        Some(p) => {
            let ep = resolve_port(&connector, &p);
            report_connect(mgr.connect(ConnectMode::Explicit(ep)).await);
        }
        None => match mgr.resume().await {
            Ok(ConnectOutcome::NoEndpoint) => pick_and_connect(&mgr, &connector, &mut input).await?,
            other => report_connect(other),
        },
    }

    println!("commands: upload <file> | status | stop | home | auto on|off | reconnect | disconnect | quit");
    loop {
        let line = tokio::select! {
            line = input.next_line() => line.context("read console")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let cmd = match parse_console(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(msg) => {
                println!("{}", msg);
                continue;
            }
        };
        match cmd {
            Console::Upload(file) => match load_plan(&file) {
                Ok(spec) => send(&mgr, Wire::StartMission(spec)).await,
                Err(e) => println!("{:#}", e),
            },
            Console::Status => send(&mgr, Wire::GetStatus).await,
            Console::Stop => send(&mgr, Wire::EmergencyStop).await,
            Console::Home => send(&mgr, Wire::ReturnHome).await,
            Console::Auto(on) => mgr.set_auto_reconnect(on).await?,
            Console::Reconnect => match mgr.connect(ConnectMode::Silent).await {
                Ok(ConnectOutcome::NoEndpoint) => pick_and_connect(&mgr, &connector, &mut input).await?,
                other => report_connect(other),
            },
            Console::Disconnect => mgr.disconnect().await?,
            Console::Quit => break,
        }
    }

    // leave the remembered device in place for the next session
    info!("operator: bye");
    Ok(())
}

/// A port name typed by the operator, upgraded to the full USB identity
/// when the port is currently present.
fn resolve_port(connector: &SerialConnector, port: &str) -> Endpoint {
    connector
        .granted()
        .ok()
        .and_then(|all| all.into_iter().find(|ep| ep.port == port))
        .unwrap_or_else(|| Endpoint::new(port))
}

async fn pick_and_connect(mgr: &ConnectionManager, connector: &SerialConnector, input: &mut Input) -> Result<()> {
    let found = connector.granted()?;
    if found.is_empty() {
        println!("no serial ports found; plug in the radio and type 'reconnect'");
        return Ok(());
    }
    for (i, ep) in found.iter().enumerate() {
        println!("[{}] {}", i, ep);
    }
    println!("select port:");
    let Some(line) = input.next_line().await.context("read console")? else {
        return Ok(());
    };
    match line.trim().parse::<usize>().ok().and_then(|i| found.get(i)) {
        Some(ep) => report_connect(mgr.connect(ConnectMode::Explicit(ep.clone())).await),
        None => println!("no such port: {}", line.trim()),
    }
    Ok(())
}

fn report_connect(res: Result<ConnectOutcome, wayline_link::LinkError>) {
    match res {
        Ok(ConnectOutcome::Connected(ep)) => println!("connected to {}", ep),
        Ok(ConnectOutcome::AlreadyConnected(ep)) => println!("already connected to {}", ep),
        Ok(ConnectOutcome::NoEndpoint) => println!("no known device available"),
        Err(e) => println!("connect failed: {}", e),
    }
}

async fn send(mgr: &ConnectionManager, cmd: Wire) {
    match mgr.send(&cmd).await {
        Ok(SendOutcome::Sent { bytes }) => info!("operator: sent {} ({} bytes)", cmd.name(), bytes),
        Ok(SendOutcome::NotConnected) => println!("not connected"),
        Err(e) => println!("{} not sent: {}", cmd.name(), e),
    }
}

async fn print_state(mgr: ConnectionManager) {
    let mut rx = mgr.watch();
    drop(mgr);
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        println!("link: {}", state);
        if state == ConnectionState::Reconnecting {
            warn!("operator: link lost, retrying");
        }
    }
}

async fn print_inbound(mut inbound: tokio::sync::mpsc::Receiver<Inbound>) {
    while let Some(msg) = inbound.recv().await {
        match msg {
            Inbound::Event(Event::Telemetry(t)) => println!(
                "telemetry {:.6},{:.6} alt {:.1} m  {:.1} m/s  hdg {:.0}  sats {} hdop {:.1}",
                t.lat, t.lng, t.alt, t.speed, t.direction, t.sat, t.hdop
            ),
            Inbound::Event(Event::Status { status, message }) => match message {
                Some(m) => println!("status {:?}: {}", status, m),
                None => println!("status {:?}", status),
            },
            Inbound::Event(Event::MissionConfirmation { mission_id, total_waypoints, status }) => {
                println!("mission {} {} ({} waypoints)", mission_id, status, total_waypoints)
            }
            Inbound::Event(Event::NavigationUpdate(u)) => {
                let mut line = format!("nav {:?} #{}", u.status, u.current_waypoint_index);
                if let Some(name) = &u.waypoint_name {
                    line.push_str(&format!(" {}", name));
                }
                if let Some(acc) = u.accuracy_meters {
                    line.push_str(&format!(" within {:.1} m", acc));
                }
                println!("{}", line);
            }
            Inbound::Event(Event::MissionStatus { mission_active, mission_state, current_waypoint, total_waypoints }) => {
                println!(
                    "mission active={} state={:?} waypoint {}/{}",
                    mission_active, mission_state, current_waypoint, total_waypoints
                )
            }
            Inbound::Diagnostic(text) => println!("vehicle: {}", text),
        }
    }
}
