// Library modules
pub mod bridge;
pub mod cancel;
pub mod commands;
pub mod constants;
pub mod error;
pub mod gatt;
pub mod pty;
pub mod ring;
pub mod script;

// Re-export commonly used types
pub use bridge::{run_device_bridge, BridgeHandle, BridgeOptions, BridgeProgress};
pub use cancel::CancelToken;
pub use error::{BridgeError, PtyError, ScriptError, TransportError};
pub use gatt::central::BtleTransport;
pub use gatt::mock::{MockPeripheral, MockTransport};
pub use gatt::notify::NotificationEngine;
pub use gatt::{
    GattConnection, GattTransport, Profile, Record, RecordFlags, StreamMode, SubscribeOptions,
};
pub use pty::{PtyEngine, PtyOptions, PtyStats};
pub use ring::RingBuffer;
pub use script::ScriptRuntime;
