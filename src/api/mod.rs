pub mod command;
pub mod messages;
pub mod process;
pub mod server;

pub use command::{ApiRequest, ApiResponse, Command, NeighborSelector};
pub use messages::{ApiEvent, EventKind, PeerEvent};
