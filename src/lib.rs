//! Relaynode - node-side supervisor for VPN engines
//!
//! # Architecture (Layered Supervision)
//!
//! ```text
//! Control channel (gRPC)
//! → Backend (config lifecycle, user membership, usage reporting)
//! → Runner (engine adapter: command line, config delivery, readiness)
//! → Process controller (child process, log capture and fan-out)
//! → Engine binary (sing-box / xray)
//! ```
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing
//! - Seams are traits; the control service only sees `VpnBackend`
//! - Engine config stays a tagged JSON tree, never a rigid record
//! - Slow log consumers lose lines, they never slow the engine down
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── backend/         # Supervision kernel: process, runner, engines
//! ├── storage/         # In-memory user/inbound repository
//! ├── service/         # Control channel handlers (gRPC)
//! ├── models.rs        # User, Inbound
//! ├── settings.rs      # Environment-driven knobs
//! └── utils.rs         # Deterministic credential derivation
//! ```

pub mod backend;
pub mod error;
pub mod models;
pub mod service;
pub mod settings;
pub mod storage;
pub mod utils;

/// Generated protobuf types for the control channel and the engine's
/// stats API.
pub mod pb {
    tonic::include_proto!("relaynode");

    pub mod stats {
        tonic::include_proto!("v2ray.core.app.stats.command");
    }
}

// Re-exports for convenience
pub use backend::{ConfigPayload, VpnBackend};
pub use error::{Error, Result};
pub use models::{Inbound, User};
pub use settings::Settings;
pub use storage::{MemoryStorage, NodeStorage};
