use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::sync::broadcast;

/// Owns the runtime the plant runs on plus the shutdown channel every
/// subsystem loop selects on. Consumer workers and device actors each
/// subscribe once; `kill` tells all of them to wind down.
#[derive(Clone)]
pub struct AppContext {
    pub rt: Arc<Runtime>,
    kill_sender: broadcast::Sender<()>,
    // held so a kill before any subsystem subscribed is not an error
    _kill_receiver: Arc<broadcast::Receiver<()>>,
}

impl AppContext {
    /// `worker_threads` comes from config. The plant's work is almost all
    /// broker and database I/O, so a handful of threads goes a long way.
    pub fn new(worker_threads: usize) -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()
            .expect("failed to build the tokio runtime");

        let (kill_sender, kill_receiver) = broadcast::channel(1);

        Self {
            rt: Arc::new(rt),
            kill_sender,
            _kill_receiver: Arc::new(kill_receiver),
        }
    }

    pub fn get_kill_receiver(&self) -> broadcast::Receiver<()> {
        self.kill_sender.subscribe()
    }

    /// A handle that can mint kill receivers without dragging the runtime
    /// along; the dispatcher hands one to every device actor it spawns.
    pub fn kill_handle(&self) -> broadcast::Sender<()> {
        self.kill_sender.clone()
    }

    /// Asks every subscribed loop to stop. Called from the ctrl-c handler
    /// and from tests.
    pub fn kill(&self) {
        let _ = self.kill_sender.send(());
    }
}
