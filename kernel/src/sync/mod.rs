//! Kernel locking primitives
//!
//! Two disciplines, both of which disable local interrupts on the holding
//! core for the duration of the hold: [`IrqMutex`] (single holder) and
//! [`IrqRwLock`] (multi-reader). [`InterruptGuard`] is the bare scope used
//! where lock acquisition and the masked region must be sequenced by hand
//! (the waitable slow path keeps interrupts masked across the context
//! switch, past the point where the object lock is released).

mod irq;
mod mutex;
mod rwlock;

pub use irq::InterruptGuard;
pub use mutex::{IrqMutex, IrqMutexGuard};
pub use rwlock::{IrqRwLock, IrqRwReadGuard, IrqRwWriteGuard};
