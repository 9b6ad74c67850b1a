//! Versioned workload container lifecycle and wire protocol.
//!
//! Workload images are tarballs hosted at HTTPS URLs. A workload's identity is
//! its [`version::VersionHash`], derived from upstream resource headers, so a
//! republished URL rolls the container without overlap. Running containers
//! speak the JSON framing protocol in [`envelope`]; [`manager`] owns the
//! container map and the forward path.

pub mod envelope;
pub mod manager;
pub mod version;

pub use envelope::AgentReply;
pub use manager::{WorkloadManager, WorkloadSettings};
pub use version::VersionHash;
