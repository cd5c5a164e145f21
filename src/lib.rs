pub mod bus;
pub mod config;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod error;
pub mod logging;
pub mod session;
pub mod sftp;
pub mod shell;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use bus::{Bus, BusEvent, EventFilter, EventTopic, RequestEnvelope, Subscription};
pub use error::{AppError, AppResult};
pub use session::{ConnectionSnapshot, ConnectionSpec, ConnectionStatus};
pub use state::AppState;
