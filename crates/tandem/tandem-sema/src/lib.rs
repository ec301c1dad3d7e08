//! Named counting semaphores shared between processes.
//!
//! Thin wrapper over POSIX `sem_open`. The creator seeds the count and owns
//! the name; attachers only hold a handle. Waits are always bounded unless
//! the caller explicitly asks for `Timeout::Infinite`.

mod semaphore;

pub use semaphore::{CountingSemaphore, WaitOutcome};
