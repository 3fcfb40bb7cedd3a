//! The transform capability shared by every stage.

use anyhow::Result;
use async_trait::async_trait;

/// Results produced for one input item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emit<T> {
    /// The item was filtered out.
    None,
    /// One result (map).
    One(T),
    /// Several results, forwarded downstream in this order (expand).
    Many(Vec<T>),
}

impl<T> Emit<T> {
    pub fn len(&self) -> usize {
        match self {
            Emit::None => 0,
            Emit::One(_) => 1,
            Emit::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> From<Option<T>> for Emit<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(item) => Emit::One(item),
            None => Emit::None,
        }
    }
}

impl<T> From<Vec<T>> for Emit<T> {
    fn from(items: Vec<T>) -> Self {
        Emit::Many(items)
    }
}

impl<T> IntoIterator for Emit<T> {
    type Item = T;
    type IntoIter = std::iter::Chain<std::option::IntoIter<T>, std::vec::IntoIter<T>>;

    fn into_iter(self) -> Self::IntoIter {
        let (single, many) = match self {
            Emit::None => (None, Vec::new()),
            Emit::One(item) => (Some(item), Vec::new()),
            Emit::Many(items) => (None, items),
        };
        single.into_iter().chain(many)
    }
}

/// A per-item processing step.
///
/// Implementations may suspend (e.g. on I/O) without blocking sibling
/// workers. An `Err` marks only this item as failed; the stage keeps going.
#[async_trait]
pub trait Transform<In, Out>: Send + Sync + 'static {
    async fn apply(&self, input: In) -> Result<Emit<Out>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_iteration_order() {
        assert_eq!(Emit::<u8>::None.into_iter().count(), 0);
        assert_eq!(Emit::One(4).into_iter().collect::<Vec<_>>(), vec![4]);
        assert_eq!(
            Emit::Many(vec![3, 1, 2]).into_iter().collect::<Vec<_>>(),
            vec![3, 1, 2]
        );
    }

    #[test]
    fn test_emit_conversions() {
        assert_eq!(Emit::from(Some(1)), Emit::One(1));
        assert_eq!(Emit::<i32>::from(None), Emit::None);
        assert_eq!(Emit::from(vec![1, 2]).len(), 2);
        assert!(Emit::<i32>::Many(Vec::new()).is_empty());
    }
}
