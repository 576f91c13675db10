pub mod control;
pub mod presence;
pub mod registry;

pub use control::ControlService;
pub use presence::{RegisterOutcome, SessionManager};
pub use registry::DeviceRegistry;
