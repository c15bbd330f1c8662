use super::EpochBoundary;

/// Increment epochs whenever the source says a batch of input ended.
#[derive(Debug, Default)]
pub struct SourceBatchEpoch {}

impl SourceBatchEpoch {
    pub fn new() -> Self {
        Self {}
    }
}

impl EpochBoundary for SourceBatchEpoch {
    fn start(&mut self) {}

    fn should_close(&mut self, items_in_epoch: usize, batch_ended: bool) -> bool {
        items_in_epoch > 0 && batch_ended
    }
}
