use anyhow::Result;
use tracing::warn;
use wayline_proto::MissionSpec;

use crate::geo::haversine_m;
use crate::mission::ARRIVAL_RADIUS_M;
use crate::vehicle::VehicleConfig;

pub fn check_gnss_source(source: &str, device: Option<&str>, file: Option<&str>, baud: u32) -> Result<()> {
    match source {
        "nmea-serial" => {
            anyhow::ensure!(device.map(|d| !d.is_empty()).unwrap_or(false), "gnss.nmea_device missing");
            anyhow::ensure!(baud >= 4800, "gnss.baud too low");
        }
        "nmea-file" => {
            anyhow::ensure!(file.map(|f| !f.is_empty()).unwrap_or(false), "gnss.nmea_file missing");
        }
        other => anyhow::bail!("unknown gnss.source: {}", other),
    }
    Ok(())
}

pub fn check_vehicle(cfg: &VehicleConfig) -> Result<()> {
    anyhow::ensure!(cfg.telemetry_interval_ms >= 100, "vehicle.telemetry_interval_ms below 100");
    anyhow::ensure!(
        cfg.status_interval_ms >= cfg.telemetry_interval_ms,
        "vehicle.status_interval_ms shorter than telemetry interval"
    );
    Ok(())
}

/// Full validation plus plan-level warnings that do not block an upload.
pub fn check_mission(spec: &MissionSpec) -> Result<()> {
    spec.validate()?;

    for (i, pair) in spec.waypoints.windows(2).enumerate() {
        let (a, b) = (&pair[0], &pair[1]);
        let d = haversine_m(
            a.latitude.unwrap_or_default(),
            a.longitude.unwrap_or_default(),
            b.latitude.unwrap_or_default(),
            b.longitude.unwrap_or_default(),
        );
        if d <= ARRIVAL_RADIUS_M {
            warn!("mission: waypoints {} and {} are {:.1}m apart, both reached on the same fix", i, i + 1, d);
        }
    }
    for (i, wp) in spec.waypoints.iter().enumerate() {
        if wp.altitude.unwrap_or_default() > spec.max_altitude {
            warn!("mission: waypoint {} altitude above max_altitude {}", i, spec.max_altitude);
        }
    }
    Ok(())
}
