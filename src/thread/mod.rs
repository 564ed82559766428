//! Worker threads with OS priority control and interrupt hooks.

pub mod factory;
pub mod priority;
pub mod worker;

pub use factory::ThreadFactory;
pub use priority::Priority;
pub use worker::{
    clear_hook, current_interrupter, interrupted, is_interrupted, sleep, thread_hook, Interrupter,
    WorkerContext, WorkerHandle, WorkerThread,
};
