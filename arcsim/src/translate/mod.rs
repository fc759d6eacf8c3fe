//! The translation pipeline
//!
//! Hot blocks flow through here: the dispatcher snapshots them into a
//! [`work_unit::TranslationWorkUnit`], the [`queue::TranslateQueue`] hands
//! units to the [`worker::WorkerPool`], the backend lowers them into a
//! [`module::TranslationModule`], and [`cache::TranslationCache`] publishes
//! the entries for dispatch. Module ownership lives in the
//! [`arena::TmArena`]; everything else holds epoch-typed handles.

pub mod arena;
pub mod cache;
pub mod module;
pub mod queue;
pub mod work_unit;
pub mod worker;

pub use arena::{TmArena, TmHandle};
pub use cache::{PublishOutcome, TranslationCache};
pub use module::{
    NativeEntryFn, NativeExit, NativeStop, TmEntry, TraceBackend, TranslateError,
    TranslationBackend, TranslationModule,
};
pub use queue::{PushOutcome, TranslateQueue};
pub use work_unit::{TranslationWorkUnit, WorkUnitBlock};
pub use worker::WorkerPool;
