pub mod events;
pub mod ids;
pub mod records;
pub mod socket;
pub mod status;

pub use ids::{SessionId, UserId, WorkflowId};
pub use status::{InvalidTransition, SessionStatus};
