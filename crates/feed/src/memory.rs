use async_trait::async_trait;
use fxsim_core::{Bar, FeedError, FeedSource};
use std::collections::VecDeque;

/// An in-memory feed source: delivers a fixed bar sequence, then `None`
/// forever. The standard source for batch backtests and tests.
pub struct MemoryFeed {
    symbol: String,
    bars: VecDeque<Bar>,
}

impl MemoryFeed {
    pub fn new(symbol: &str, bars: impl IntoIterator<Item = Bar>) -> Self {
        Self {
            symbol: symbol.to_string(),
            bars: bars.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.bars.len()
    }
}

#[async_trait]
impl FeedSource for MemoryFeed {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn next(&mut self) -> Result<Option<Bar>, FeedError> {
        Ok(self.bars.pop_front())
    }
}
