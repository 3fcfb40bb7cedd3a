//! Closure-backed transforms: map, filter and expand.

use super::{Emit, Transform};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;

/// One output per input. Built by [`map`].
pub struct Map<F>(F);

/// Keep inputs matching a predicate. Built by [`filter`].
pub struct Filter<F>(F);

/// Zero or more outputs per input. Built by [`expand`].
pub struct Expand<F>(F);

/// Synchronous fallible map. Built by [`try_map`].
pub struct TryMap<F>(F);

/// Transform each item with an async function.
pub fn map<F>(f: F) -> Map<F> {
    Map(f)
}

/// Drop items for which `predicate` returns false.
pub fn filter<F>(predicate: F) -> Filter<F> {
    Filter(predicate)
}

/// Turn each item into a sequence of items, forwarded in order.
pub fn expand<F>(f: F) -> Expand<F> {
    Expand(f)
}

/// Transform each item with a plain function that may fail.
pub fn try_map<F>(f: F) -> TryMap<F> {
    TryMap(f)
}

#[async_trait]
impl<In, Out, F, Fut> Transform<In, Out> for Map<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out>> + Send + 'static,
{
    async fn apply(&self, input: In) -> Result<Emit<Out>> {
        (self.0)(input).await.map(Emit::One)
    }
}

#[async_trait]
impl<T, F> Transform<T, T> for Filter<F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    async fn apply(&self, input: T) -> Result<Emit<T>> {
        if (self.0)(&input) {
            Ok(Emit::One(input))
        } else {
            Ok(Emit::None)
        }
    }
}

#[async_trait]
impl<In, Out, F, Fut> Transform<In, Out> for Expand<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Out>>> + Send + 'static,
{
    async fn apply(&self, input: In) -> Result<Emit<Out>> {
        (self.0)(input).await.map(Emit::Many)
    }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for TryMap<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Result<Out> + Send + Sync + 'static,
{
    async fn apply(&self, input: In) -> Result<Emit<Out>> {
        (self.0)(input).map(Emit::One)
    }
}
