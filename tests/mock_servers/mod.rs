//! Mock servers for integration testing
//!
//! These simulate the relay's collaborators (a Plex Media Server, a relay push
//! channel) so the HTTP and WebSocket paths run for real without a Plex install.

pub mod plex;
pub mod push;

pub use plex::MockPlexServer;
pub use push::MockPushServer;
