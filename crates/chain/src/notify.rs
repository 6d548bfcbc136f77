//! Chain event fan-out on a dedicated notification thread.
//!
//! Observer callbacks never run under the engine lock, so a listener may
//! call back into the engine without deadlocking.

use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::store::StoredBlock;

/// Callbacks for chain tip movement. All methods have empty defaults, so
/// observers implement only what they care about.
pub trait ChainListener: Send + Sync {
    fn new_best_block(&self, _block: &StoredBlock) {}

    fn side_chain_block(&self, _block: &StoredBlock) {}

    /// `old_blocks` and `new_blocks` run tip-first down to the fork point.
    fn reorganize(
        &self,
        _fork: &StoredBlock,
        _old_blocks: &[StoredBlock],
        _new_blocks: &[StoredBlock],
    ) {
    }
}

pub(crate) enum ChainEvent {
    NewBest(StoredBlock),
    SideChain(StoredBlock),
    Reorganize {
        fork: StoredBlock,
        old_blocks: Vec<StoredBlock>,
        new_blocks: Vec<StoredBlock>,
    },
}

type ListenerSet = Arc<Mutex<Vec<Weak<dyn ChainListener>>>>;

pub(crate) struct NotificationExecutor {
    sender: Option<Sender<ChainEvent>>,
    listeners: ListenerSet,
    worker: Option<JoinHandle<()>>,
}

impl NotificationExecutor {
    pub(crate) fn spawn() -> Self {
        let listeners: ListenerSet = Arc::new(Mutex::new(Vec::new()));
        let (sender, receiver) = unbounded::<ChainEvent>();
        let worker_listeners = Arc::clone(&listeners);
        let worker = std::thread::Builder::new()
            .name("chain-notify".to_string())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    dispatch(&worker_listeners, &event);
                }
            })
            .expect("spawn notification thread");
        Self {
            sender: Some(sender),
            listeners,
            worker: Some(worker),
        }
    }

    pub(crate) fn add_listener(&self, listener: &Arc<dyn ChainListener>) {
        let mut listeners = self.listeners.lock().expect("listener lock");
        listeners.push(Arc::downgrade(listener));
    }

    pub(crate) fn publish(&self, event: ChainEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

impl Drop for NotificationExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn dispatch(listeners: &ListenerSet, event: &ChainEvent) {
    let snapshot: Vec<Arc<dyn ChainListener>> = {
        let mut guard = listeners.lock().expect("listener lock");
        guard.retain(|weak| weak.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    };
    for listener in snapshot {
        match event {
            ChainEvent::NewBest(block) => listener.new_best_block(block),
            ChainEvent::SideChain(block) => listener.side_chain_block(block),
            ChainEvent::Reorganize {
                fork,
                old_blocks,
                new_blocks,
            } => listener.reorganize(fork, old_blocks, new_blocks),
        }
    }
}
