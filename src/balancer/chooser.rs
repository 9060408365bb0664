use rand::Rng;

/// Errors from building or picking with a chooser.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChooserError {
    #[error("Invalid weight {weight} at index {index}")]
    InvalidWeight { index: usize, weight: f64 },

    #[error("Total weight {total} is not finite")]
    TotalOverflow { total: f64 },

    #[error("No items to choose from")]
    Empty,

    #[error("No item has a positive weight")]
    NoEligibleCandidate,
}

/// Immutable weighted item list with precomputed prefix sums.
#[derive(Debug, Clone)]
pub struct Chooser<K, T> {
    unique_key: K,
    items: Vec<(T, f64)>,
    cumulative: Vec<f64>,
    total: f64,
}

impl<K: Clone, T: Clone> Chooser<K, T> {
    /// Build a chooser. Fails if any weight is NaN, infinite or negative.
    pub fn build(unique_key: K, items: Vec<(T, f64)>) -> Result<Self, ChooserError> {
        let mut cumulative = Vec::with_capacity(items.len());
        let mut running = 0.0;
        for (index, (_, weight)) in items.iter().enumerate() {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ChooserError::InvalidWeight {
                    index,
                    weight: *weight,
                });
            }
            running += weight;
            cumulative.push(running);
        }
        if !running.is_finite() {
            return Err(ChooserError::TotalOverflow { total: running });
        }

        Ok(Self {
            unique_key,
            items,
            cumulative,
            total: running,
        })
    }

    /// New chooser with the same key over a new item list.
    pub fn refresh(&self, items: Vec<(T, f64)>) -> Result<Self, ChooserError> {
        Self::build(self.unique_key.clone(), items)
    }
}

impl<K, T> Chooser<K, T> {
    /// Uniform pick ignoring weight.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&T> {
        if self.items.is_empty() {
            return None;
        }
        let index = rng.random_range(0..self.items.len());
        Some(&self.items[index].0)
    }

    /// Pick with probability proportional to weight.
    ///
    /// Zero-weight items are never returned. A non-empty list whose weights
    /// are all zero fails with `NoEligibleCandidate`.
    pub fn pick_weighted<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<&T, ChooserError> {
        if self.items.is_empty() {
            return Err(ChooserError::Empty);
        }
        if self.total <= 0.0 {
            return Err(ChooserError::NoEligibleCandidate);
        }

        let target = rng.random_range(0.0..self.total);
        let index = self.cumulative.partition_point(|&c| c <= target);
        // Rounding at the top end can push past the last prefix sum.
        let index = index.min(self.items.len() - 1);
        Ok(&self.items[index].0)
    }

    /// Uniform pick using the thread-local generator.
    pub fn random(&self) -> Option<&T> {
        self.pick(&mut rand::rng())
    }

    /// Weighted pick using the thread-local generator.
    pub fn random_with_weight(&self) -> Result<&T, ChooserError> {
        self.pick_weighted(&mut rand::rng())
    }

    pub fn unique_key(&self) -> &K {
        &self.unique_key
    }

    pub fn items(&self) -> &[(T, f64)] {
        &self.items
    }

    pub fn total_weight(&self) -> f64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K: PartialEq, T: PartialEq> PartialEq for Chooser<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.unique_key == other.unique_key && self.items == other.items
    }
}
