//! Dendrite is a prototype-oriented neuro-symbolic runtime.
//!
//! Its core is the *synaptic bridge*: a transactional, handle-based FFI
//! that lets a prototype object kernel drive an opaque numeric substrate
//! while a write-ahead log stays the single durable source of truth for
//! object state.
//!
//! The main pieces, leaves first:
//!
//! - [`value`]: the tagged value model shared by every subsystem.
//! - [`kernel`]: slot tables, clone-based delegation, message dispatch.
//! - [`registry`]: refcounted handles for cross-language references.
//! - [`marshal`]: primitives copy, everything else becomes a handle.
//! - [`gate`]: the single serialization point for foreign access.
//! - [`bridge`]: eval / call / load_module / async_eval across the gate.
//! - [`wal`]: the transactional slot log and its replay.
//! - [`vsa`]: hypervector operations and the ANN index facade.
//! - [`events`]: the inbound event dispatch contract.
//! - [`runtime`]: the embedder surface tying it all together.

pub mod bridge;
pub mod error;
pub mod events;
pub mod foreign;
pub mod gate;
pub mod kernel;
pub mod marshal;
pub mod registry;
pub mod runtime;
pub mod textual;
pub mod value;
pub mod vsa;
pub mod wal;

pub use crate::bridge::{BridgeConfig, SynapticBridge, ThreadMode};
pub use crate::error::{Error, MarshalFault, Result};
pub use crate::events::{dispatch_event, EventKind};
pub use crate::foreign::{EmbeddedRuntime, ForeignErrorRecord, ForeignRuntime};
pub use crate::gate::Gate;
pub use crate::kernel::{Kernel, ObjectState};
pub use crate::registry::HandleRegistry;
pub use crate::runtime::{Runtime, RuntimeConfig};
pub use crate::value::{HandleKind, HandleRef, ObjectId, Value};
pub use crate::vsa::{AnnIndex, IndexKind, SearchHit, VsaOps};
pub use crate::wal::{Origin, SlotLog, WalRecord};
