//! Translation worker pool
//!
//! Worker threads loop pop → compile → publish until the queue closes.
//! Compile failures are logged and the unit discarded; the affected blocks
//! simply stay interpreted. Publish effects travel to the dispatcher as
//! commands applied at its next block boundary.

use super::arena::TmArena;
use super::cache::TranslationCache;
use super::module::TranslationBackend;
use super::queue::TranslateQueue;
use crate::invalidate::{Command, CommandQueue};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` worker threads.
    pub fn spawn(
        count: usize,
        queue: Arc<TranslateQueue>,
        tc: Arc<TranslationCache>,
        arena: Arc<TmArena>,
        commands: Arc<CommandQueue>,
        backend: Arc<dyn TranslationBackend>,
    ) -> Self {
        let handles = (0..count)
            .map(|index| {
                let queue = queue.clone();
                let tc = tc.clone();
                let arena = arena.clone();
                let commands = commands.clone();
                let backend = backend.clone();
                std::thread::Builder::new()
                    .name(format!("translate-{index}"))
                    .spawn(move || worker_loop(index, &queue, &tc, &arena, &commands, &*backend))
                    .expect("failed to spawn translation worker")
            })
            .collect();
        WorkerPool { handles }
    }

    /// Closes the queue and joins the workers. Queued units are still
    /// compiled and published before the threads exit.
    pub fn shutdown(mut self, queue: &TranslateQueue) {
        queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    index: usize,
    queue: &TranslateQueue,
    tc: &TranslationCache,
    arena: &TmArena,
    commands: &CommandQueue,
    backend: &dyn TranslationBackend,
) {
    debug!("translation worker {index} up");
    while let Some(unit) = queue.pop() {
        match backend.compile(&unit) {
            Ok(module) => {
                let blocks = module.entries().len();
                let outcome = tc.publish(arena, module);
                for (pc, handle) in outcome.bound {
                    commands.push(Command::BindNative {
                        pc,
                        handle,
                        generation: unit.generation,
                    });
                }
                for pc in outcome.reverted {
                    commands.push(Command::RevertEntry {
                        block: pc,
                        instrumented: false,
                    });
                }
                debug!(
                    "worker {index} published {blocks} blocks for {} (epoch {})",
                    unit.page,
                    tc.epoch()
                );
            }
            Err(error) => {
                warn!(
                    "worker {index} failed to translate {}: {error}",
                    unit.page
                );
            }
        }
        queue.finish(&unit);
        tc.reclaim();
    }
    info!("translation worker {index} exiting");
}
