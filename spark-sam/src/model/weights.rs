use crate::error::LoadError;
use ndarray::ArrayD;
use std::collections::HashMap;

/// Wildcard dimension in an expected shape.
pub(crate) const ANY: usize = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WeightId(usize);

/// Flat, name-indexed collection of every tensor in a weight file.
///
/// Layer records hold [`WeightId`]s into this store instead of owning tensors.
#[derive(Debug, Default)]
pub struct WeightStore {
    tensors: Vec<ArrayD<f32>>,
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tensor, replacing an earlier one with the same name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> WeightId {
        let name = name.into();
        if let Some(&index) = self.by_name.get(&name) {
            self.tensors[index] = tensor;
            return WeightId(index);
        }

        let index = self.tensors.len();
        self.tensors.push(tensor);
        self.names.push(name.clone());
        self.by_name.insert(name, index);
        WeightId(index)
    }

    pub fn get(&self, id: WeightId) -> &ArrayD<f32> {
        &self.tensors[id.0]
    }

    pub fn name(&self, id: WeightId) -> &str {
        &self.names[id.0]
    }

    pub fn lookup(&self, name: &str) -> Option<WeightId> {
        self.by_name.get(name).map(|&index| WeightId(index))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of f32 elements held by the store.
    pub fn n_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }

    /// Resolves `name` and checks its shape; [`ANY`] matches every extent.
    pub(crate) fn bind(&self, name: &str, expected: &[usize]) -> Result<WeightId, LoadError> {
        let id = self
            .lookup(name)
            .ok_or_else(|| LoadError::MissingTensor(name.to_string()))?;

        let actual = self.get(id).shape();
        let matches = actual.len() == expected.len()
            && actual
                .iter()
                .zip(expected)
                .all(|(&a, &e)| e == ANY || a == e);
        if !matches {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn store() -> WeightStore {
        let mut store = WeightStore::new();
        store.insert("a.weight", ArrayD::zeros(IxDyn(&[4, 2])));
        store.insert("a.bias", ArrayD::zeros(IxDyn(&[4])));
        store
    }

    #[test]
    fn bind_checks_presence_and_shape() {
        let store = store();
        assert!(store.bind("a.weight", &[4, 2]).is_ok());
        assert!(store.bind("a.weight", &[ANY, 2]).is_ok());
        assert!(matches!(
            store.bind("a.weight", &[2, 4]),
            Err(LoadError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            store.bind("a.bias", &[4, 1]),
            Err(LoadError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            store.bind("b.weight", &[4, 2]),
            Err(LoadError::MissingTensor(name)) if name == "b.weight"
        ));
    }

    #[test]
    fn insert_replaces_by_name() {
        let mut store = store();
        let id = store.lookup("a.bias").unwrap();
        let again = store.insert("a.bias", ArrayD::ones(IxDyn(&[4])));
        assert_eq!(id, again);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(id)[[0]], 1.0);
        assert_eq!(store.name(id), "a.bias");
    }
}
