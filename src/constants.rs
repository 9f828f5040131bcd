// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Default TCP port the broadcast server listens on
pub const DEFAULT_PORT: u16 = 8080;

/// Default interface selection (false = bind to the current local address)
pub const DEFAULT_LISTEN_ON_ALL_INTERFACES: bool = false;

/// Outside address used to ask the OS which local address routes off-host
///
/// Only a UDP `connect` is made against it; nothing is sent.
pub const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Highest port number flagged as reserved
///
/// Ports in `1..=RESERVED_PORT_MAX` usually need elevated privileges. They are
/// flagged for the user but never rejected.
pub const RESERVED_PORT_MAX: u16 = 1024;

/// Default capture resolution
pub const DEFAULT_RESOLUTION: (u32, u32) = (640, 480);

/// Default fixed frame-rate range (lower, upper) for both cameras
pub const DEFAULT_FPS_RANGE: (u32, u32) = (30, 30);

/// Frame rate synthetic sources run at when no fixed range is requested
pub const AUTO_FRAME_RATE: u32 = 30;

/// Default JPEG quality (1-100)
pub const DEFAULT_QUALITY: u8 = 85;

/// JPEG quality bounds
pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;

/// Common capture resolutions offered for selection
pub const COMMON_RESOLUTIONS: [(u32, u32); 6] = [
    (320, 240),
    (640, 480),
    (800, 600),
    (1280, 720),
    (1920, 1080),
    (3840, 2160),
];

/// Capacity of the connection event channel
///
/// Slow event subscribers lag and lose events instead of stalling the server.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the state transition channel
pub const STATE_CHANNEL_CAPACITY: usize = 16;

/// Timeouts and delays used by the server and supervisor
pub mod timing {
    use super::Duration;

    /// Upper bound for the WebSocket handshake of a single connection
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Upper bound for sending the close frame to a client during shutdown
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Delay between control channel reconnect attempts after the first
    /// immediate retry failed
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);
}
