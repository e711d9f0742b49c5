//! Kernel objects
//!
//! Everything a thread can block on specializes the reference-counted
//! [`waitable::Waitable`] primitive: events, semaphores, processes,
//! threads, and the opaque file/stream objects. Named objects additionally
//! live in the global [`registry`].

pub mod event;
pub mod registry;
pub mod semaphore;
pub mod waitable;

pub use event::Event;
pub use semaphore::Semaphore;
pub use waitable::{KernelObject, ObjPtr, ObjectKind, WaitReason, Waitable};
