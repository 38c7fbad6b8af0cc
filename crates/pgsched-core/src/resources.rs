//! Scalar resource vectors

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Quantities below this are treated as zero when comparing resource sets
const EPSILON: f64 = 1e-9;

/// A mapping of resource name to quantity (e.g. `{"CPU": 4, "GPU": 1}`)
///
/// Names missing from the set count as zero. Serialized as a plain table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSet(BTreeMap<String, f64>);

impl ResourceSet {
    /// Create an empty resource set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insertion of a single quantity
    pub fn with(mut self, name: impl Into<String>, quantity: f64) -> Self {
        self.set(name, quantity);
        self
    }

    /// Set the quantity for a resource, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, quantity: f64) {
        self.0.insert(name.into(), quantity);
    }

    /// Quantity of the named resource (zero if absent)
    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    /// Whether every quantity in the set is zero
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|q| q.abs() < EPSILON)
    }

    /// Iterate over `(name, quantity)` pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Whether this set can satisfy `request`
    ///
    /// Every requested quantity must be available; zero-quantity requests
    /// are always satisfied.
    pub fn is_superset_of(&self, request: &ResourceSet) -> bool {
        request
            .0
            .iter()
            .all(|(name, &wanted)| wanted <= EPSILON || self.get(name) + EPSILON >= wanted)
    }

    /// Add every quantity of `other` into this set
    pub fn add(&mut self, other: &ResourceSet) {
        for (name, &quantity) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0.0) += quantity;
        }
    }

    /// Subtract every quantity of `other`, saturating at zero
    pub fn subtract(&mut self, other: &ResourceSet) {
        for (name, &quantity) in &other.0 {
            let entry = self.0.entry(name.clone()).or_insert(0.0);
            *entry = (*entry - quantity).max(0.0);
        }
    }

    /// Sum a sequence of resource sets
    pub fn sum<'a>(sets: impl IntoIterator<Item = &'a ResourceSet>) -> ResourceSet {
        let mut total = ResourceSet::new();
        for set in sets {
            total.add(set);
        }
        total
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl std::fmt::Display for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (name, quantity)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, quantity)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superset_treats_missing_as_zero() {
        let available = ResourceSet::new().with("CPU", 4.0);
        assert!(available.is_superset_of(&ResourceSet::new().with("CPU", 4.0)));
        assert!(!available.is_superset_of(&ResourceSet::new().with("GPU", 1.0)));
        assert!(available.is_superset_of(&ResourceSet::new().with("GPU", 0.0)));
    }

    #[test]
    fn test_sum_and_subtract() {
        let a = ResourceSet::new().with("CPU", 1.0);
        let b = ResourceSet::new().with("CPU", 2.0).with("memory", 512.0);
        let total = ResourceSet::sum([&a, &b]);
        assert_eq!(total.get("CPU"), 3.0);
        assert_eq!(total.get("memory"), 512.0);

        let mut remaining = ResourceSet::new().with("CPU", 2.0);
        remaining.subtract(&total);
        assert_eq!(remaining.get("CPU"), 0.0);
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_display() {
        let set = ResourceSet::new().with("GPU", 1.0).with("CPU", 4.0);
        assert_eq!(set.to_string(), "{CPU: 4, GPU: 1}");
    }

    #[test]
    fn test_toml_table() {
        let set: ResourceSet = toml::from_str("CPU = 2.0\nGPU = 1.0").unwrap();
        assert_eq!(set.get("CPU"), 2.0);
        assert_eq!(set.get("GPU"), 1.0);
    }
}
