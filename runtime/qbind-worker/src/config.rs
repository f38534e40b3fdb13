use clap::Parser;
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "qbind-worker", about = "Runs parameterized SQL requests framed on stdin")]
pub struct WorkerConfig {
    /// Worker threads; defaults to the available parallelism.
    #[arg(long, env = "QBIND_THREADS")]
    pub threads: Option<usize>,

    /// Requests buffered before new ones are answered with `Busy`.
    #[arg(long, env = "QBIND_MAX_QUEUE", default_value_t = 64)]
    pub max_queue: usize,

    #[arg(long, env = "QBIND_LOG", default_value = "info")]
    pub log_level: Level,
}

impl WorkerConfig {
    pub fn thread_count(&self) -> usize {
        self.threads.filter(|count| *count > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(4)
        })
    }

    pub fn queue_capacity(&self) -> usize {
        self.max_queue.max(1)
    }
}
