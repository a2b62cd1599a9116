//! SSH Session Manager.
//!
//! [`SshConnector`] dials (optionally through an upstream proxy), verifies the
//! host key and authenticates, producing an [`SshSession`]. The
//! [`SessionManager`] owns the current session for one tunnel and publishes it
//! through a [`SessionSlot`]; forwarders only ever see the slot.
//!
//! Everything the forwarders need is expressed through the [`Session`] and
//! [`Connector`] traits so they can run over a loopback implementation in tests.

mod backoff;
mod connector;
pub mod credential;
pub mod dial;
mod handler;
mod manager;
mod session;

pub use backoff::Backoff;
pub use connector::SshConnector;
pub use manager::{SessionManager, SessionSlot};
pub use session::{Connector, InboundChannel, RemoteListener, Session, SshSession};
