//! Plugins executing filter decisions
//!
//! - [`DirectPlugin`]: forward over raced upstream connections, or tunnel
//!   CONNECT requests
//! - [`MockPlugin`]: answer with a canned response
//! - [`StripPlugin`]: terminate TLS locally so the tunnelled requests pass
//!   through the filter chain again

pub mod cert;
mod direct;
mod mock;
mod strip;

pub use cert::{load_server_config, CertProvider, DirectoryCertProvider, StaticCertProvider};
pub use direct::{build_wire_request, DirectPlugin, UpstreamRequest};
pub use mock::MockPlugin;
pub use strip::StripPlugin;
