use std::sync::Arc;

use ironbase_txn::checkpoint::{CheckpointSink, CheckpointToken};
use ironbase_txn::{MemoryKernel, TxnConfig, TxnEngine};
use parking_lot::Mutex;

/// Checkpoint sink that records every notified token.
#[derive(Default)]
pub struct RecordingSink {
    notified: Mutex<Vec<CheckpointToken>>,
}

impl RecordingSink {
    pub fn notified(&self) -> Vec<CheckpointToken> {
        self.notified.lock().clone()
    }
}

impl CheckpointSink for RecordingSink {
    fn durable(&self, token: CheckpointToken) {
        self.notified.lock().push(token);
    }
}

pub fn create_engine(config: TxnConfig) -> (Arc<MemoryKernel>, Arc<RecordingSink>, TxnEngine) {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Arc::new(MemoryKernel::new());
    let sink = Arc::new(RecordingSink::default());
    let engine = TxnEngine::new(kernel.clone(), config, sink.clone());
    (kernel, sink, engine)
}
