use super::EpochBoundary;

/// Use for deterministic epochs in tests. Increment epoch by 1 after
/// each item.
///
/// You almost assuredly do not want to use this unless you are
/// writing tests of the recovery system.
#[derive(Debug, Default)]
pub struct TestingEpoch {}

impl TestingEpoch {
    pub fn new() -> Self {
        Self {}
    }
}

impl EpochBoundary for TestingEpoch {
    fn start(&mut self) {}

    fn should_close(&mut self, items_in_epoch: usize, _batch_ended: bool) -> bool {
        items_in_epoch > 0
    }
}

#[test]
fn closes_after_each_item() {
    let mut boundary = TestingEpoch::new();
    assert!(!boundary.should_close(0, true));
    assert!(boundary.should_close(1, false));
}
