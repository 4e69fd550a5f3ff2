pub mod canon;
pub mod db;
mod densemap;
pub mod engine;
pub mod fs;
pub mod graph;
pub mod progress;
pub mod run;
pub mod sandbox;
mod task;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
