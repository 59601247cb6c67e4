pub mod config;
pub mod credentials;
pub mod error;
pub mod fanout;
pub mod geocode;
pub mod lifecycle;
pub mod mock;
pub mod qr;
pub mod reconciler;
pub mod reconnect;
pub mod registry;
pub mod serializer;

pub use config::EngineConfig;
pub use error::SessionError;
pub use lifecycle::{SessionManager, SessionManagerBuilder};
pub use registry::{SessionHandle, SessionRegistry};
