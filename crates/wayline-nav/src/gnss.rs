use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;
use wayline_proto::LineFramer;

const KNOTS_TO_MPS: f64 = 0.514_444;

/// One position estimate. Consumers copy what they need; nothing keeps a
/// fix past the cycle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub lat: f64,
    pub lng: f64,
    pub alt: f64,
    /// Ground speed, m/s.
    pub speed: f64,
    /// Course over ground, degrees.
    pub course: f64,
    pub satellite_count: u8,
    pub hdop: f32,
    pub valid: bool,
    pub timestamp: OffsetDateTime,
}

impl Fix {
    /// A valid, stationary fix with good geometry.
    pub fn new(lat: f64, lng: f64, alt: f64) -> Self {
        Self {
            lat,
            lng,
            alt,
            speed: 0.0,
            course: 0.0,
            satellite_count: 9,
            hdop: 0.9,
            valid: true,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn unix_ms(&self) -> i64 {
        (self.timestamp.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Anything that yields fixes, one per cycle.
pub trait PositionSource {
    /// Must be cancel-safe: the vehicle loop polls it inside `select!`.
    fn next_fix(&mut self) -> impl Future<Output = Result<Fix>> + Send;
}

// ----- NMEA -----

#[derive(Debug, Clone, Copy)]
struct Gga {
    quality: u8,
    sats: u8,
    hdop: f32,
    alt: f64,
}

/// Minimal NMEA 0183 reader: GGA supplies quality/satellites/altitude, RMC
/// supplies position and velocity and completes a fix.
#[derive(Debug, Default)]
pub struct NmeaParser {
    last_gga: Option<Gga>,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, line: &str, now: OffsetDateTime) -> Option<Fix> {
        let body = strip_checksum(line.trim())?;
        let parts: Vec<&str> = body.split(',').collect();
        let kind = parts.first()?.get(3..)?;

        match kind {
            "GGA" if parts.len() > 9 => {
                self.last_gga = Some(Gga {
                    quality: parts[6].parse().unwrap_or(0),
                    sats: parts[7].parse().unwrap_or(0),
                    hdop: parts[8].parse().unwrap_or(99.9),
                    alt: parts[9].parse().unwrap_or(0.0),
                });
                None
            }
            "RMC" if parts.len() > 9 => {
                let lat = parse_deg_min(parts[3], parts[4]);
                let lng = parse_deg_min(parts[5], parts[6]);
                let gga = self.last_gga;
                let valid = parts[2] == "A"
                    && lat.is_some()
                    && lng.is_some()
                    && gga.map(|g| g.quality > 0).unwrap_or(true);

                Some(Fix {
                    lat: lat.unwrap_or(0.0),
                    lng: lng.unwrap_or(0.0),
                    alt: gga.map(|g| g.alt).unwrap_or(0.0),
                    speed: parts[7].parse::<f64>().unwrap_or(0.0) * KNOTS_TO_MPS,
                    course: parts[8].parse().unwrap_or(0.0),
                    satellite_count: gga.map(|g| g.sats).unwrap_or(0),
                    hdop: gga.map(|g| g.hdop).unwrap_or(99.9),
                    valid,
                    timestamp: parse_rmc_time(parts[1], parts[9]).unwrap_or(now),
                })
            }
            _ => None,
        }
    }
}

/// Returns the sentence body between `$` and `*`, or None when the
/// checksum is present and wrong.
fn strip_checksum(s: &str) -> Option<&str> {
    let s = s.strip_prefix('$')?;
    let Some((body, sum)) = s.split_once('*') else {
        return Some(s);
    };
    let expected = u8::from_str_radix(sum.get(..2)?, 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual == expected {
        Some(body)
    } else {
        debug!("nmea: checksum mismatch in {}", s);
        None
    }
}

fn parse_deg_min(v: &str, hemi: &str) -> Option<f64> {
    if v.is_empty() { return None; }
    // lat: ddmm.mmmm, lon: dddmm.mmmm
    let dot = v.find('.')?;
    let deg_len = if dot > 4 { 3 } else { 2 };
    let deg: f64 = v.get(..deg_len)?.parse().ok()?;
    let min: f64 = v.get(deg_len..)?.parse().ok()?;
    let mut out = deg + (min / 60.0);
    if hemi == "S" || hemi == "W" { out = -out; }
    Some(out)
}

fn parse_rmc_time(hms: &str, dmy: &str) -> Option<OffsetDateTime> {
    let num = |s: &str, r: std::ops::Range<usize>| -> Option<u8> { s.get(r)?.parse().ok() };
    let day = num(dmy, 0..2)?;
    let month = Month::try_from(num(dmy, 2..4)?).ok()?;
    let year = 2000 + num(dmy, 4..6)? as i32;
    let secs: f64 = hms.get(4..)?.parse().ok()?;
    let millis = ((secs.fract() * 1000.0).round() as u16).min(999);
    let time = Time::from_hms_milli(num(hms, 0..2)?, num(hms, 2..4)?, secs.trunc() as u8, millis).ok()?;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

// ----- Sources -----

/// NMEA sentences from a byte stream: a serial receiver or a replay file.
pub struct GnssSource<R> {
    reader: R,
    framer: LineFramer,
    pending: VecDeque<String>,
    parser: NmeaParser,
    follow_eof: bool,
    pace: Option<Duration>,
    next_due: Option<Instant>,
}

impl GnssSource<SerialStream> {
    pub fn serial(dev: &str, baud: u32) -> Result<Self> {
        let port = tokio_serial::new(dev, baud).open_native_async()
            .with_context(|| format!("open serial {}", dev))?;
        Ok(Self::new(port, false, None))
    }
}

impl GnssSource<File> {
    /// Replays a recorded NMEA log, one fix per `pace`. At end of file the
    /// source waits for more data instead of failing.
    pub fn file(path: &str, pace: Duration) -> Result<Self> {
        let f = std::fs::File::open(path).with_context(|| format!("open nmea file {}", path))?;
        Ok(Self::new(File::from_std(f), true, Some(pace)))
    }
}

impl<R: AsyncRead + Unpin> GnssSource<R> {
    pub fn new(reader: R, follow_eof: bool, pace: Option<Duration>) -> Self {
        Self {
            reader,
            framer: LineFramer::default(),
            pending: VecDeque::new(),
            parser: NmeaParser::new(),
            follow_eof,
            pace,
            next_due: None,
        }
    }
}

impl<R: AsyncRead + Unpin + Send> PositionSource for GnssSource<R> {
    async fn next_fix(&mut self) -> Result<Fix> {
        if let Some(due) = self.next_due {
            tokio::time::sleep_until(due).await;
        }
        loop {
            while let Some(line) = self.pending.pop_front() {
                if let Some(fix) = self.parser.parse_line(&line, OffsetDateTime::now_utc()) {
                    self.next_due = self.pace.map(|p| Instant::now() + p);
                    return Ok(fix);
                }
            }

            let mut chunk = [0u8; 512];
            let n = self.reader.read(&mut chunk).await.context("read gnss")?;
            if n == 0 {
                if self.follow_eof {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                anyhow::bail!("gnss stream closed");
            }
            for frame in self.framer.accumulate(&chunk[..n]) {
                match frame {
                    Ok(line) => self.pending.push_back(line),
                    Err(e) => debug!("gnss: {}", e),
                }
            }
        }
    }
}
