pub mod doctor;
pub mod geo;
pub mod gnss;
pub mod mission;
pub mod vehicle;

pub use gnss::{Fix, GnssSource, PositionSource};
pub use mission::{MissionController, MissionError, MissionStatus};
pub use vehicle::{Vehicle, VehicleConfig};
