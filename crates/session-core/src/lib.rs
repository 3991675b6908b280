//! Bearer session lifecycle for API clients.
//!
//! The crate attaches credentials to outgoing calls, notices when the backend
//! stops accepting them, renews them with a single refresh call no matter how
//! many requests failed at once, and replays the deferred requests in the
//! order they failed. When renewal is impossible the session is torn down and
//! every waiting caller gets a definite answer.
//!
//! # Architecture
//!
//! - [`CredentialStore`]: current credential + user, mirrored to a [`SessionPersistence`]
//! - [`Transport`]: one HTTP exchange; [`HttpTransport`] is the `reqwest` implementation
//! - [`interceptor`]: bearer + timestamp decoration of every attempt
//! - [`classify`]: status/body to [`SessionError`]
//! - [`SessionManager`]: login, logout, initialization, proactive refresh and
//!   the authenticated request wrapper with single-flight refresh and replay
//! - [`Notice`]/[`Notifier`]: presentation of failures that reached a caller

pub mod classify;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod models;
pub mod notice;
mod refresh;
mod session;
pub mod store;
mod timer;
pub mod transport;

pub use config::{AuthEndpoints, SessionConfig};
pub use error::{FieldError, Result, SessionError};
pub use models::{Credential, LoginOutcome, LoginRequest, SessionStatus, User};
pub use notice::{Notice, NoticeAction, Notifier, TracingNotifier};
pub use session::{SessionManager, SessionManagerBuilder};
pub use store::{
    CredentialStore, FilePersistence, MemoryPersistence, PersistedSession, SessionPersistence,
};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport, TransportError};
