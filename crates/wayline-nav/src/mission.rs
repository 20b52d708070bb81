use thiserror::Error;
use tracing::{debug, error, info, warn};
use wayline_proto::{
    Command, Event, MissionPhase, MissionSpec, NavStatus, NavigationUpdate, SystemStatus,
    ValidationError,
};

use crate::geo::haversine_m;
use crate::gnss::Fix;

/// A waypoint counts as reached inside this radius.
pub const ARRIVAL_RADIUS_M: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub alt: f64,
    pub reached: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    pub id: String,
    pub waypoints: Vec<Waypoint>,
    pub max_speed: f64,
    pub max_altitude: f64,
    pub return_to_home: bool,
}

impl Mission {
    /// `spec` must already be validated.
    fn from_spec(spec: &MissionSpec, id: String) -> Self {
        let waypoints = spec
            .waypoints
            .iter()
            .enumerate()
            .map(|(i, wp)| Waypoint {
                name: if wp.name.is_empty() { format!("WP{}", i + 1) } else { wp.name.clone() },
                lat: wp.latitude.unwrap_or_default(),
                lng: wp.longitude.unwrap_or_default(),
                alt: wp.altitude.unwrap_or_default(),
                reached: false,
            })
            .collect();
        Self {
            id,
            waypoints,
            max_speed: spec.max_speed,
            max_altitude: spec.max_altitude,
            return_to_home: spec.return_to_home,
        }
    }

    pub fn total(&self) -> usize {
        self.waypoints.len()
    }
}

#[derive(Debug, Error)]
pub enum MissionError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("no active mission")]
    NoActiveMission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionStatus {
    pub active: bool,
    pub state: MissionPhase,
    /// -1 unless navigating.
    pub current_index: i32,
    pub total: usize,
}

impl From<MissionStatus> for Event {
    fn from(s: MissionStatus) -> Self {
        Event::MissionStatus {
            mission_active: s.active,
            mission_state: s.state,
            current_waypoint: s.current_index,
            total_waypoints: s.total,
        }
    }
}

/// Mission state. Only the navigating phase has a current waypoint, so an
/// index can never outlive its mission.
#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Loaded(Mission),
    Navigating { mission: Mission, current: usize },
    Complete(Mission),
}

impl Phase {
    fn label(&self) -> MissionPhase {
        match self {
            Phase::Idle => MissionPhase::Idle,
            Phase::Loaded(_) => MissionPhase::Loaded,
            Phase::Navigating { .. } => MissionPhase::Navigating,
            Phase::Complete(_) => MissionPhase::Complete,
        }
    }
}

/// Idle -> Loaded -> Navigating -> Complete -> Idle, plus any -> Idle for
/// emergency stop and replacement.
fn edge_allowed(from: MissionPhase, to: MissionPhase) -> bool {
    use MissionPhase::*;
    matches!(
        (from, to),
        (Idle, Loaded) | (Loaded, Navigating) | (Navigating, Complete) | (_, Idle)
    )
}

/// Vehicle-side mission executor. Every operation returns the events to
/// send to the operator, in order.
#[derive(Debug)]
pub struct MissionController {
    phase: Phase,
}

impl Default for MissionController {
    fn default() -> Self {
        Self::new()
    }
}

impl MissionController {
    pub fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    /// Applies `f` to the current phase. A result that is not a legal edge
    /// from the current phase is refused and the phase is left as it was.
    fn transition(&mut self, f: impl FnOnce(Phase) -> Phase) {
        let kept = self.phase.clone();
        let from = kept.label();
        let next = f(std::mem::replace(&mut self.phase, Phase::Idle));
        let to = next.label();
        if from == to {
            self.phase = next;
            return;
        }
        if !edge_allowed(from, to) {
            error!("mission: refusing illegal transition {:?} -> {:?}", from, to);
            self.phase = kept;
            return;
        }
        debug!("mission: {:?} -> {:?}", from, to);
        self.phase = next;
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Loaded(_) | Phase::Navigating { .. })
    }

    pub fn mission(&self) -> Option<&Mission> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Loaded(m) | Phase::Complete(m) => Some(m),
            Phase::Navigating { mission, .. } => Some(mission),
        }
    }

    pub fn load_mission(&mut self, spec: &MissionSpec) -> Result<Vec<Event>, MissionError> {
        if let Err(e) = spec.validate() {
            warn!("mission: rejected: {}", e);
            return Err(e.into());
        }
        if let Some(declared) = spec.total_waypoints {
            if declared != spec.waypoints.len() {
                warn!("mission: total_waypoints={} but {} waypoints sent; using list", declared, spec.waypoints.len());
            }
        }
        if self.is_active() {
            if let Some(old) = self.mission() {
                warn!("mission: replacing active mission {}", old.id);
            }
            self.reset();
        }

        let mission = Mission::from_spec(spec, format!("M{:08X}", rand::random::<u32>()));
        let id = mission.id.clone();
        let total = mission.total();
        let first = mission.waypoints[0].clone();

        self.transition(|_| Phase::Loaded(mission));
        self.transition(|p| match p {
            Phase::Loaded(mission) => Phase::Navigating { mission, current: 0 },
            other => other,
        });

        info!("mission: {} loaded with {} waypoints, heading to {}", id, total, first.name);
        Ok(vec![
            Event::MissionConfirmation { mission_id: id, total_waypoints: total, status: "accepted".into() },
            Event::NavigationUpdate(target_update(NavStatus::NavigationStarted, 0, &first)),
        ])
    }

    /// Feed one position fix.
    pub fn tick(&mut self, fix: &Fix) -> Vec<Event> {
        if !fix.valid {
            return Vec::new();
        }
        let Phase::Navigating { mission, current } = &mut self.phase else {
            return Vec::new();
        };

        let index = *current;
        let target = &mut mission.waypoints[index];
        let distance = haversine_m(fix.lat, fix.lng, target.lat, target.lng);
        if target.reached || distance > ARRIVAL_RADIUS_M {
            return Vec::new();
        }

        target.reached = true;
        info!("mission: reached {} ({}) at {:.2}m", index, target.name, distance);

        let mut reached = target_update(NavStatus::WaypointReached, index, target);
        reached.accuracy_meters = Some(distance);
        reached.current_lat = Some(fix.lat);
        reached.current_lng = Some(fix.lng);
        let mut events = vec![Event::NavigationUpdate(reached)];

        *current += 1;
        if let Some(next) = mission.waypoints.get(*current) {
            info!("mission: navigating to {} ({})", *current, next.name);
            events.push(Event::NavigationUpdate(target_update(NavStatus::NavigatingTo, *current, next)));
        } else {
            events.extend(self.complete_mission());
        }
        events
    }

    /// Finish the running mission and reset. No-op unless navigating.
    pub fn complete_mission(&mut self) -> Vec<Event> {
        let status = match &self.phase {
            Phase::Navigating { mission, .. } if mission.return_to_home => NavStatus::ReturningHome,
            Phase::Navigating { .. } => NavStatus::MissionComplete,
            _ => return Vec::new(),
        };
        vec![self.finish(status)]
    }

    pub fn emergency_stop(&mut self) -> Vec<Event> {
        if let Some(m) = self.mission() {
            warn!("mission: emergency stop, aborting {}", m.id);
        } else {
            warn!("mission: emergency stop while idle");
        }
        self.reset();
        vec![Event::status(SystemStatus::EmergencyStop)]
    }

    /// Reports intent to return and ends the mission in place. No path back
    /// is planned or followed.
    pub fn return_home(&mut self) -> Result<Vec<Event>, MissionError> {
        if !matches!(self.phase, Phase::Navigating { .. }) {
            warn!("mission: return_home without an active mission");
            return Err(MissionError::NoActiveMission);
        }
        Ok(vec![self.finish(NavStatus::ReturningHome)])
    }

    pub fn status(&self) -> MissionStatus {
        let (current_index, total) = match &self.phase {
            Phase::Idle => (-1, 0),
            Phase::Navigating { mission, current } => (*current as i32, mission.total()),
            Phase::Loaded(m) | Phase::Complete(m) => (-1, m.total()),
        };
        MissionStatus { active: self.is_active(), state: self.phase.label(), current_index, total }
    }

    /// Apply one decoded command. Failures become `command_error` status
    /// events so the operator always hears back.
    pub fn handle(&mut self, cmd: Command) -> Vec<Event> {
        debug!("mission: command {}", cmd.name());
        let result = match cmd {
            Command::StartMission(spec) => self.load_mission(&spec),
            Command::GetStatus => Ok(vec![self.status().into()]),
            Command::EmergencyStop => Ok(self.emergency_stop()),
            Command::ReturnHome => self.return_home(),
        };
        result.unwrap_or_else(|e| vec![Event::status_with(SystemStatus::CommandError, e.to_string())])
    }

    fn finish(&mut self, status: NavStatus) -> Event {
        let mut index = 0;
        self.transition(|p| match p {
            Phase::Navigating { mission, current } => {
                index = current;
                Phase::Complete(mission)
            }
            other => other,
        });
        if let Some(m) = self.mission() {
            info!("mission: {} finished ({:?}) at waypoint {}", m.id, status, index);
        }
        self.reset();
        Event::NavigationUpdate(NavigationUpdate::new(status, index as i32))
    }

    fn reset(&mut self) {
        self.transition(|_| Phase::Idle);
    }
}

fn target_update(status: NavStatus, index: usize, wp: &Waypoint) -> NavigationUpdate {
    let mut u = NavigationUpdate::new(status, index as i32);
    u.waypoint_name = Some(wp.name.clone());
    u.target_lat = Some(wp.lat);
    u.target_lng = Some(wp.lng);
    u
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayline_proto::{WaypointSpec, MAX_WAYPOINTS};

    fn spec(points: &[(f64, f64)], rth: bool) -> MissionSpec {
        let mut s = MissionSpec::new(
            points
                .iter()
                .enumerate()
                .map(|(i, (lat, lng))| WaypointSpec::new(format!("W{}", i + 1), *lat, *lng, 5.0))
                .collect(),
        );
        s.return_to_home = rth;
        s
    }

    fn nav(ev: &Event) -> &NavigationUpdate {
        match ev {
            Event::NavigationUpdate(u) => u,
            other => panic!("expected navigation_update, got {:?}", other),
        }
    }

    const W1: (f64, f64) = (10.0, 10.0);
    const W2: (f64, f64) = (10.0001, 10.0001);

    #[test]
    fn load_any_valid_size_starts_navigating() {
        for n in 1..=MAX_WAYPOINTS {
            let points: Vec<_> = (0..n).map(|i| (10.0 + i as f64 * 0.01, 10.0)).collect();
            let mut mc = MissionController::new();
            let events = mc.load_mission(&spec(&points, false)).unwrap();

            assert_eq!(events.len(), 2);
            match &events[0] {
                Event::MissionConfirmation { total_waypoints, mission_id, .. } => {
                    assert_eq!(*total_waypoints, n);
                    assert!(!mission_id.is_empty());
                }
                other => panic!("unexpected {:?}", other),
            }
            let started = nav(&events[1]);
            assert_eq!(started.status, NavStatus::NavigationStarted);
            assert_eq!(started.current_waypoint_index, 0);
            assert_eq!(started.waypoint_name.as_deref(), Some("W1"));

            let st = mc.status();
            assert_eq!(st.state, MissionPhase::Navigating);
            assert_eq!(st.current_index, 0);
            assert_eq!(st.total, n);
            assert!(st.active);
        }
    }

    #[test]
    fn invalid_specs_leave_state_untouched() {
        let mut mc = MissionController::new();
        assert!(matches!(mc.load_mission(&spec(&[], false)), Err(MissionError::Invalid(ValidationError::NoWaypoints))));

        let too_many: Vec<_> = (0..21).map(|i| (1.0, i as f64 * 0.001)).collect();
        assert!(matches!(
            mc.load_mission(&spec(&too_many, false)),
            Err(MissionError::Invalid(ValidationError::Capacity { count: 21, max: 20 }))
        ));
        assert_eq!(mc.status().state, MissionPhase::Idle);

        // a bad upload must not disturb a running mission
        mc.load_mission(&spec(&[W1, W2], false)).unwrap();
        let before = mc.status();
        let mut missing = spec(&[W1], false);
        missing.waypoints[0].longitude = None;
        assert!(mc.load_mission(&missing).is_err());
        assert_eq!(mc.status(), before);
    }

    #[test]
    fn status_is_idempotent() {
        let mut mc = MissionController::new();
        mc.load_mission(&spec(&[W1, W2], false)).unwrap();
        let first = mc.status();
        for _ in 0..10 {
            assert_eq!(mc.status(), first);
        }
        assert_eq!(mc.mission().unwrap().waypoints.iter().filter(|w| w.reached).count(), 0);
    }

    #[test]
    fn two_waypoint_scenario() {
        let mut mc = MissionController::new();
        mc.load_mission(&spec(&[W1, W2], false)).unwrap();

        let ev = mc.tick(&Fix::new(W1.0, W1.1, 5.0));
        assert_eq!(ev.len(), 2);
        let reached = nav(&ev[0]);
        assert_eq!(reached.status, NavStatus::WaypointReached);
        assert_eq!(reached.current_waypoint_index, 0);
        assert!(reached.accuracy_meters.unwrap() < 1e-6);
        assert_eq!(reached.current_lat, Some(W1.0));
        let next = nav(&ev[1]);
        assert_eq!(next.status, NavStatus::NavigatingTo);
        assert_eq!(next.current_waypoint_index, 1);
        assert_eq!(mc.status().current_index, 1);
        assert!(mc.mission().unwrap().waypoints[0].reached);

        let ev = mc.tick(&Fix::new(W2.0, W2.1, 5.0));
        assert_eq!(ev.len(), 2);
        assert_eq!(nav(&ev[0]).status, NavStatus::WaypointReached);
        assert_eq!(nav(&ev[0]).current_waypoint_index, 1);
        assert_eq!(nav(&ev[1]).status, NavStatus::MissionComplete);

        let st = mc.status();
        assert_eq!(st.state, MissionPhase::Idle);
        assert_eq!(st.current_index, -1);
        assert_eq!(st.total, 0);
        assert!(mc.mission().is_none());

        // nothing more after completion
        assert!(mc.tick(&Fix::new(W2.0, W2.1, 5.0)).is_empty());
    }

    #[test]
    fn return_to_home_flag_changes_final_event() {
        let mut mc = MissionController::new();
        mc.load_mission(&spec(&[W1], true)).unwrap();
        let ev = mc.tick(&Fix::new(W1.0, W1.1, 5.0));
        let kinds: Vec<_> = ev.iter().map(|e| nav(e).status).collect();
        assert_eq!(kinds, vec![NavStatus::WaypointReached, NavStatus::ReturningHome]);
        assert_eq!(mc.status().state, MissionPhase::Idle);
    }

    #[test]
    fn each_waypoint_advances_exactly_once() {
        let mut mc = MissionController::new();
        mc.load_mission(&spec(&[W1, W2, W1], false)).unwrap();

        let mut last = 0;
        let at_w1 = Fix::new(W1.0, W1.1, 5.0);
        assert_eq!(mc.tick(&at_w1).len(), 2);
        for _ in 0..3 {
            // parked on W1 while W2 is the target: no progress
            assert!(mc.tick(&at_w1).is_empty());
            let idx = mc.status().current_index;
            assert!(idx >= last);
            last = idx;
        }
        assert_eq!(mc.status().current_index, 1);
    }

    #[test]
    fn ignores_invalid_or_distant_fixes() {
        let mut mc = MissionController::new();
        mc.load_mission(&spec(&[W1], false)).unwrap();

        let mut bad = Fix::new(W1.0, W1.1, 5.0);
        bad.valid = false;
        assert!(mc.tick(&bad).is_empty());

        // ~5.6 m north: just outside the radius
        assert!(mc.tick(&Fix::new(W1.0 + 0.00005, W1.1, 5.0)).is_empty());
        // ~4.4 m north: inside
        let ev = mc.tick(&Fix::new(W1.0 + 0.00004, W1.1, 5.0));
        assert_eq!(nav(&ev[0]).status, NavStatus::WaypointReached);
        assert!(nav(&ev[0]).accuracy_meters.unwrap() <= ARRIVAL_RADIUS_M);
    }

    #[test]
    fn tick_while_idle_is_a_no_op() {
        let mut mc = MissionController::new();
        assert!(mc.tick(&Fix::new(W1.0, W1.1, 5.0)).is_empty());
        assert!(mc.complete_mission().is_empty());
    }

    #[test]
    fn emergency_stop_from_any_state() {
        let mut idle = MissionController::new();
        let mut navigating = MissionController::new();
        navigating.load_mission(&spec(&[W1, W2], false)).unwrap();
        let mut midway = MissionController::new();
        midway.load_mission(&spec(&[W1, W2], false)).unwrap();
        midway.tick(&Fix::new(W1.0, W1.1, 5.0));

        for mc in [&mut idle, &mut navigating, &mut midway] {
            let ev = mc.emergency_stop();
            assert_eq!(ev, vec![Event::status(SystemStatus::EmergencyStop)]);
            let st = mc.status();
            assert_eq!(st.state, MissionPhase::Idle);
            assert_eq!(st.total, 0);
            assert_eq!(st.current_index, -1);
            assert!(!st.active);
        }
    }

    #[test]
    fn return_home_aborts_in_place() {
        let mut mc = MissionController::new();
        assert!(matches!(mc.return_home(), Err(MissionError::NoActiveMission)));

        mc.load_mission(&spec(&[W1, W2], false)).unwrap();
        let ev = mc.return_home().unwrap();
        assert_eq!(ev.len(), 1);
        assert_eq!(nav(&ev[0]).status, NavStatus::ReturningHome);
        assert_eq!(nav(&ev[0]).current_waypoint_index, 0);
        assert_eq!(mc.status().state, MissionPhase::Idle);
    }

    #[test]
    fn reload_replaces_running_mission() {
        let mut mc = MissionController::new();
        mc.load_mission(&spec(&[W1, W2], false)).unwrap();
        let first_id = mc.mission().unwrap().id.clone();
        mc.tick(&Fix::new(W1.0, W1.1, 5.0));

        mc.load_mission(&spec(&[W2], false)).unwrap();
        let m = mc.mission().unwrap();
        assert_ne!(m.id, first_id);
        assert_eq!(m.total(), 1);
        assert!(!m.waypoints[0].reached);
        assert_eq!(mc.status().current_index, 0);
    }

    #[test]
    fn handle_turns_failures_into_command_error() {
        let mut mc = MissionController::new();
        let ev = mc.handle(Command::ReturnHome);
        assert!(matches!(
            &ev[..],
            [Event::Status { status: SystemStatus::CommandError, message: Some(_) }]
        ));

        let ev = mc.handle(Command::StartMission(spec(&[], false)));
        assert!(matches!(&ev[..], [Event::Status { status: SystemStatus::CommandError, .. }]));

        let ev = mc.handle(Command::GetStatus);
        assert_eq!(
            ev,
            vec![Event::MissionStatus {
                mission_active: false,
                mission_state: MissionPhase::Idle,
                current_waypoint: -1,
                total_waypoints: 0,
            }]
        );
    }

    #[test]
    fn unnamed_waypoints_get_positional_names() {
        let mut s = spec(&[W1, W2], false);
        s.waypoints[1].name.clear();
        let mut mc = MissionController::new();
        mc.load_mission(&s).unwrap();
        assert_eq!(mc.mission().unwrap().waypoints[1].name, "WP2");
    }

    #[test]
    fn illegal_transition_keeps_current_phase() {
        let mut mc = MissionController::new();
        mc.load_mission(&spec(&[W1, W2], false)).unwrap();
        let id = mc.mission().unwrap().id.clone();

        // Navigating -> Loaded is not an edge
        mc.transition(|p| match p {
            Phase::Navigating { mission, .. } => Phase::Loaded(mission),
            other => other,
        });
        assert!(matches!(mc.phase, Phase::Navigating { current: 0, .. }));
        assert_eq!(mc.mission().unwrap().id, id);

        // nor is Idle -> Navigating
        let mut idle = MissionController::new();
        let mission = Mission::from_spec(&spec(&[W1], false), "M1".into());
        idle.transition(|_| Phase::Navigating { mission, current: 0 });
        assert!(!idle.is_active());
        assert!(idle.mission().is_none());
    }
}
