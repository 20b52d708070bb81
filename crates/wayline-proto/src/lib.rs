pub mod codec;
pub mod error;
pub mod framer;
pub mod message;

pub use codec::{decode, encode, Decoded, Schema, MAX_MESSAGE_SIZE};
pub use error::{FrameError, ProtoError, ValidationError};
pub use framer::LineFramer;
pub use message::{
    Command, Event, MissionPhase, MissionSpec, NavStatus, NavigationUpdate, SystemStatus,
    Telemetry, WaypointSpec, MAX_WAYPOINTS,
};
