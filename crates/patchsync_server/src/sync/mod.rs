mod connection;
mod room;

pub use connection::RoomConnection;
pub use room::{EntityRoom, RoomUpdate, SyncState, SyncStats};
