use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Fixed waypoint capacity of the vehicle controller.
pub const MAX_WAYPOINTS: usize = 20;

// ----- Operator -> vehicle -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    StartMission(MissionSpec),
    GetStatus,
    EmergencyStop,
    ReturnHome,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartMission(_) => "start_mission",
            Command::GetStatus => "get_status",
            Command::EmergencyStop => "emergency_stop",
            Command::ReturnHome => "return_home",
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Command::StartMission(spec) => spec.validate(),
            _ => Ok(()),
        }
    }
}

/// Waypoint as sent on the wire. Coordinates are optional here so that a
/// missing one surfaces as a validation error rather than a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointSpec {
    #[serde(default)]
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
}

impl WaypointSpec {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude: Some(latitude),
            longitude: Some(longitude),
            altitude: Some(altitude),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionSpec {
    pub waypoints: Vec<WaypointSpec>,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    #[serde(default = "default_max_altitude")]
    pub max_altitude: f64,
    #[serde(default)]
    pub return_to_home: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_waypoints: Option<usize>,
}

fn default_max_speed() -> f64 { 5.0 }
fn default_max_altitude() -> f64 { 50.0 }

impl MissionSpec {
    pub fn new(waypoints: Vec<WaypointSpec>) -> Self {
        let total = waypoints.len();
        Self {
            waypoints,
            max_speed: default_max_speed(),
            max_altitude: default_max_altitude(),
            return_to_home: false,
            total_waypoints: Some(total),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let count = self.waypoints.len();
        if count == 0 {
            return Err(ValidationError::NoWaypoints);
        }
        if count > MAX_WAYPOINTS {
            return Err(ValidationError::Capacity { count, max: MAX_WAYPOINTS });
        }
        if !(self.max_speed.is_finite() && self.max_speed > 0.0) {
            return Err(ValidationError::Rejected(format!("max_speed must be positive, got {}", self.max_speed)));
        }
        if !(self.max_altitude.is_finite() && self.max_altitude > 0.0) {
            return Err(ValidationError::Rejected(format!("max_altitude must be positive, got {}", self.max_altitude)));
        }

        for (index, wp) in self.waypoints.iter().enumerate() {
            let lat = wp.latitude.ok_or(ValidationError::MissingField { index, field: "latitude" })?;
            let lng = wp.longitude.ok_or(ValidationError::MissingField { index, field: "longitude" })?;
            let alt = wp.altitude.ok_or(ValidationError::MissingField { index, field: "altitude" })?;

            if !lat.is_finite() || lat.abs() > 90.0 {
                return Err(ValidationError::OutOfRange { index, field: "latitude", value: lat });
            }
            if !lng.is_finite() || lng.abs() > 180.0 {
                return Err(ValidationError::OutOfRange { index, field: "longitude", value: lng });
            }
            if !alt.is_finite() {
                return Err(ValidationError::OutOfRange { index, field: "altitude", value: alt });
            }
        }
        Ok(())
    }
}

// ----- Vehicle -> operator -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Telemetry(Telemetry),
    Status {
        status: SystemStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    MissionConfirmation {
        mission_id: String,
        total_waypoints: usize,
        status: String,
    },
    NavigationUpdate(NavigationUpdate),
    MissionStatus {
        mission_active: bool,
        mission_state: MissionPhase,
        current_waypoint: i32,
        total_waypoints: usize,
    },
}

impl Event {
    pub fn status(status: SystemStatus) -> Self {
        Event::Status { status, message: None }
    }

    pub fn status_with(status: SystemStatus, message: impl Into<String>) -> Self {
        Event::Status { status, message: Some(message.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub lat: f64,
    pub lng: f64,
    pub alt: f64,
    pub sat: u8,
    pub speed: f64,
    pub hdop: f32,
    pub direction: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    SystemReady,
    WaitingGpsFix,
    EmergencyStop,
    CommandError,
    UnknownCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavStatus {
    NavigationStarted,
    NavigatingTo,
    WaypointReached,
    ReturningHome,
    MissionComplete,
}

/// Coarse mission state as reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionPhase {
    Idle,
    Loaded,
    Navigating,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationUpdate {
    pub status: NavStatus,
    pub current_waypoint_index: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waypoint_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_lng: Option<f64>,
}

impl NavigationUpdate {
    pub fn new(status: NavStatus, current_waypoint_index: i32) -> Self {
        Self {
            status,
            current_waypoint_index,
            waypoint_name: None,
            target_lat: None,
            target_lng: None,
            accuracy_meters: None,
            current_lat: None,
            current_lng: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wp(i: usize) -> WaypointSpec {
        WaypointSpec::new(format!("WP{}", i), 10.0 + i as f64 * 0.001, 10.0, 5.0)
    }

    #[test]
    fn empty_mission_is_rejected() {
        let spec = MissionSpec::new(vec![]);
        assert_eq!(spec.validate(), Err(ValidationError::NoWaypoints));
    }

    #[test]
    fn capacity_is_enforced_not_truncated() {
        let spec = MissionSpec::new((0..MAX_WAYPOINTS + 1).map(wp).collect());
        assert_eq!(spec.validate(), Err(ValidationError::Capacity { count: 21, max: 20 }));

        let spec = MissionSpec::new((0..MAX_WAYPOINTS).map(wp).collect());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn missing_coordinate_names_the_waypoint() {
        let mut spec = MissionSpec::new(vec![wp(0), wp(1)]);
        spec.waypoints[1].altitude = None;
        assert_eq!(
            spec.validate(),
            Err(ValidationError::MissingField { index: 1, field: "altitude" })
        );
    }

    #[test]
    fn out_of_range_latitude() {
        let spec = MissionSpec::new(vec![WaypointSpec::new("bad", 91.0, 0.0, 5.0)]);
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::OutOfRange { index: 0, field: "latitude", .. })
        ));
    }

    #[test]
    fn start_mission_wire_shape() {
        let json = r#"{"action":"start_mission","waypoints":[{"name":"A","latitude":1.5,"longitude":2.5,"altitude":10}],"return_to_home":true}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        let Command::StartMission(spec) = cmd else { panic!("wrong variant") };
        assert_eq!(spec.waypoints.len(), 1);
        assert_eq!(spec.waypoints[0].altitude, Some(10.0));
        assert!(spec.return_to_home);
        assert_eq!(spec.max_speed, 5.0);
        assert_eq!(spec.total_waypoints, None);
    }

    #[test]
    fn navigation_update_omits_absent_fields() {
        let ev = Event::NavigationUpdate(NavigationUpdate::new(NavStatus::MissionComplete, 2));
        let s = serde_json::to_string(&ev).unwrap();
        assert_eq!(s, r#"{"type":"navigation_update","status":"mission_complete","current_waypoint_index":2}"#);
    }

    #[test]
    fn status_event_wire_shape() {
        let s = serde_json::to_string(&Event::status(SystemStatus::WaitingGpsFix)).unwrap();
        assert_eq!(s, r#"{"type":"status","status":"waiting_gps_fix"}"#);
    }
}
