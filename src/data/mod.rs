//! Data Model
//!
//! Immutable snapshot types shared between the engine and its collaborators:
//! finished measurement trees, scalar samples, environment facts, and the
//! bounded history buffer used by the sampler.

mod hierarchical;
mod ring_buffer;
mod scalar;

pub use hierarchical::{intern, CorrelationId, HierarchicalData, HierarchicalDataRoot};
pub use ring_buffer::RingBuffer;
pub use scalar::{EnvironmentData, ScalarDataPoint};
