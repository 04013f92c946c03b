use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::MarketDataProvider;
use crate::domain::MarketSnapshot;
use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
struct Cursor {
    index: usize,
    /// Symbols already served from the current batch
    served: HashSet<String>,
}

/// Market data replayed from recorded snapshot batches.
///
/// Each batch is one refresh of the universe. The cursor moves to the next
/// batch as soon as a symbol is requested a second time, so a cycle that
/// fetches its universe in several chunks still reads one consistent batch.
/// After the last batch the final one keeps being served.
#[derive(Debug)]
pub struct ReplayMarketData {
    batches: Vec<Vec<MarketSnapshot>>,
    universe: Vec<String>,
    cursor: Mutex<Cursor>,
}

impl ReplayMarketData {
    pub fn new(batches: Vec<Vec<MarketSnapshot>>) -> Self {
        let universe: BTreeSet<String> = batches
            .iter()
            .flatten()
            .map(|s| s.symbol.clone())
            .collect();
        Self {
            batches,
            universe: universe.into_iter().collect(),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Load a JSON array of snapshot batches
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let batches: Vec<Vec<MarketSnapshot>> = serde_json::from_str(&raw)?;
        if batches.is_empty() {
            return Err(EngineError::validation(format!(
                "replay file {} contains no batches",
                path.display()
            )));
        }
        info!(path = %path.display(), batches = batches.len(), "loaded replay data");
        Ok(Self::new(batches))
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub async fn current_batch(&self) -> usize {
        self.cursor.lock().await.index
    }

    pub async fn is_exhausted(&self) -> bool {
        self.cursor.lock().await.index + 1 >= self.batches.len()
    }
}

#[async_trait]
impl MarketDataProvider for ReplayMarketData {
    fn universe(&self) -> Vec<String> {
        self.universe.clone()
    }

    async fn get_snapshot(&self, symbols: &[String]) -> Result<Vec<MarketSnapshot>> {
        if self.batches.is_empty() {
            return Err(EngineError::MarketDataUnavailable(
                "no replay batches loaded".into(),
            ));
        }

        let mut cursor = self.cursor.lock().await;
        let repeat = symbols.iter().any(|s| cursor.served.contains(s));
        if repeat && cursor.index + 1 < self.batches.len() {
            cursor.index += 1;
            cursor.served.clear();
            debug!(batch = cursor.index, "advanced replay batch");
        }
        cursor.served.extend(symbols.iter().cloned());

        let wanted: HashSet<&str> = symbols.iter().map(String::as_str).collect();
        Ok(self.batches[cursor.index]
            .iter()
            .filter(|s| wanted.contains(s.symbol.as_str()))
            .cloned()
            .collect())
    }
}
