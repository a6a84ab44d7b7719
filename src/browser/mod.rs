pub mod cookies;
pub mod driver;
pub mod session;

pub use session::{SessionGuard, SessionManager, SessionState};
