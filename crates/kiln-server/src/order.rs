//! The dependencies a session still has to obtain, in request order.

use std::collections::{BTreeMap, VecDeque};

use kiln_proto::ContentHash;
use rand::Rng;
use rand::seq::SliceRandom;

/// Needed dependencies (mapped path → hash) plus the fixed, shuffled order
/// in which they are requested.
///
/// The key set of the order always equals the key set of the map: entries
/// leave both together through [`DependencyOrder::complete_head`].
/// Sessions negotiating overlapping sets at the same time each walk them
/// in their own order, so they do not all upload the same file at once.
#[derive(Debug, Default)]
pub struct DependencyOrder {
    needed: BTreeMap<String, ContentHash>,
    order: VecDeque<String>,
}

impl DependencyOrder {
    /// Shuffle once; the order is never reshuffled afterwards.
    pub fn shuffled<R: Rng + ?Sized>(needed: BTreeMap<String, ContentHash>, rng: &mut R) -> Self {
        let mut order: Vec<String> = needed.keys().cloned().collect();
        order.shuffle(rng);
        Self {
            needed,
            order: order.into(),
        }
    }

    /// The dependency the next request (or the outstanding one) is for.
    pub fn head(&self) -> Option<(&str, ContentHash)> {
        let path = self.order.front()?;
        self.needed.get(path).map(|hash| (path.as_str(), *hash))
    }

    /// Drop the head from both the order and the needed set.
    pub fn complete_head(&mut self) -> Option<(String, ContentHash)> {
        let path = self.order.pop_front()?;
        let hash = self.needed.remove(&path)?;
        Some((path, hash))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys in request order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn needed(&self) -> &BTreeMap<String, ContentHash> {
        &self.needed
    }
}
