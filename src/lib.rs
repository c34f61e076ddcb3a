//! Partitioned coupling core for two independently written simulation codes.
//!
//! Two *participants* — each a multi-rank distributed program — advance
//! through a synchronized sequence of time steps and exchange boundary data
//! across their shared interface. For implicit coupling the exchanged data
//! is iteratively relaxed with fixed-point acceleration until the configured
//! convergence measures pass.
//!
//! # Architecture
//!
//! ```text
//! host solver ──► SerialCouplingScheme ──► Acceleration (Aitken, IQN-ILS, …)
//!                        │                 ConvergenceMeasure
//!                        ▼
//!                 ParticipantLink ──► master channel + PointToPointExchange
//!                        │
//!                        ▼
//!                 Transport / CollectiveBus (pluggable)
//! ```
//!
//! The crate deliberately stops at the coupling core: configuration loading,
//! exporters, mesh mapping and concrete socket/MPI transports are host
//! concerns, injected through the seams in [`transport`] and [`mesh`].

pub mod acceleration;
pub mod context;
pub mod exchange;
pub mod mesh;
pub mod scheme;
pub mod stats;
pub mod transport;

// Prelude
pub use context::CouplingContext;
pub use exchange::{ParticipantLink, PointToPointExchange};
pub use mesh::{InterfaceMesh, MeshId, VertexDistribution};
pub use scheme::{
    Action, CouplingMode, CouplingScheme, DataId, SchemeConfig, SerialCouplingScheme,
    TimesteppingMethod,
};
