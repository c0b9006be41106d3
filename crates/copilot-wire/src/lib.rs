//! Copilot wire protocol — the message bus extended across machines.
//!
//! Nodes connect to each other over mutually authenticated TLS. Trust is not
//! derived from a CA: each side pins the other's certificate fingerprint
//! (on first contact when dialing out, after operator approval when
//! accepting), then both prove possession of a shared secret with an
//! HMAC-SHA256 challenge-response on every connection. Once established, a
//! session relays newline-delimited JSON envelopes between the socket and
//! the local [`copilot_bus::MessageBus`].
//!
//! ## Architecture
//!
//! - **TlsIdentity**: the node's self-signed certificate and pinning verifiers
//! - **Session**: per-connection state machine
//! - **Transport**: listeners and reconnecting dialers that spawn sessions
//! - **PeerRegistry**: live view of established sessions
//! - **AdminHandler**: `tls` group commands (accept, reject, add, delete)

pub mod admin;
pub mod context;
pub mod error;
pub mod message;
pub mod registry;
pub mod session;
pub mod tls;
pub mod transport;

pub use admin::AdminHandler;
pub use context::{WireConfig, WireContext};
pub use error::{WireError, WireResult};
pub use registry::{PeerEntry, PeerRegistry};
pub use session::{Session, SessionRole, SessionState};
pub use tls::{PeerCertificate, TlsIdentity};
pub use transport::Transport;
