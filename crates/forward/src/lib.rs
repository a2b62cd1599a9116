//! The forwarding half of the tunnel engine.
//!
//! Every forwarder accepts raw connections, obtains a channel from the current
//! session through a [`ssh::SessionSlot`] and hands both ends to [`relay()`].
//! The [`Supervisor`] wires a session manager and one forwarder together per
//! tunnel and owns its state machine.

mod connection;
pub mod dynamic;
pub mod local;
pub mod relay;
pub mod remote;
mod supervisor;

pub use connection::ForwardContext;
pub use relay::{relay, RelayEnd, RelayStats};
pub use supervisor::{Supervisor, TunnelState, TunnelStatus};
