// Library exports for testing and embedding

pub mod bridge;
pub mod config;
pub mod inject;
pub mod js;
pub mod state;

// Re-export commonly used types for tests
pub use bridge::{Bridge, BridgeError, CommandName, Envelope, Mode, PageEvents};
pub use config::BridgeConfig;
pub use inject::{DataKey, Injector, ScriptItem, Stage};
pub use state::BridgeState;
