pub mod events;
pub mod notifications;
pub mod party;
pub mod presence;
pub mod rooms;
pub mod session;
