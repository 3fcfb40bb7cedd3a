//! Work items carried between pipeline stages.

/// A payload plus the sequence number its producer assigned, if any.
///
/// Items move by value: a queue owns an item until a worker takes it, and the
/// worker owns it until it hands the results downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub seq: Option<u64>,
    pub payload: T,
}

impl<T> WorkItem<T> {
    /// An item without a sequence number.
    pub fn new(payload: T) -> Self {
        Self { seq: None, payload }
    }

    pub fn with_seq(seq: u64, payload: T) -> Self {
        Self {
            seq: Some(seq),
            payload,
        }
    }

    /// Replace the payload, keeping the sequence number.
    pub fn derive<U>(&self, payload: U) -> WorkItem<U> {
        WorkItem {
            seq: self.seq,
            payload,
        }
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T> From<T> for WorkItem<T> {
    fn from(payload: T) -> Self {
        Self::new(payload)
    }
}
