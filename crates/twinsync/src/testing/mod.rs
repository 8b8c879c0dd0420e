//! In-process hub, device emulator and fault injection for deterministic
//! tests against [`Session`](crate::Session).

pub mod emulator;
pub mod fault;
pub mod hub;
pub mod registry;

pub use emulator::DeviceEmulator;
pub use fault::{FaultCloseReason, FaultInjection, FaultKind};
pub use hub::{SimulatedHub, SimulatedTransport};
pub use registry::InMemoryRegistry;
