//! Generators of unique string identifiers, used for bucket ids and enqueue identifiers.

use std::{
    fmt,
    sync::{atomic::AtomicU64, Arc},
};

use crate::atomic::ORDERING;

pub trait UniqueIdGenerator: fmt::Debug + Send + Sync {
    fn generate(&self) -> String;
}

pub type SharedIdGenerator = Arc<dyn UniqueIdGenerator>;

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl UuidGenerator {
    pub fn shared() -> SharedIdGenerator {
        Arc::new(UuidGenerator)
    }
}

impl UniqueIdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Yields `<prefix>1`, `<prefix>2`, and so on.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl UniqueIdGenerator for SequentialIdGenerator {
    fn generate(&self) -> String {
        let n = self.next.fetch_add(1, ORDERING);
        format!("{}{}", self.prefix, n)
    }
}

/// Always yields the same value. Only useful where a test wants to predict ids exactly.
#[derive(Debug, Clone)]
pub struct FixedIdGenerator {
    value: String,
}

impl FixedIdGenerator {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl UniqueIdGenerator for FixedIdGenerator {
    fn generate(&self) -> String {
        self.value.clone()
    }
}
