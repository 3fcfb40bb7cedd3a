//! Built-in numeric transforms used by the CLI and by tests.
//!
//! Each variant is a concrete, named transform over `i64`; configs refer to
//! them by name (`square`, `keep_even`, `expand:3`, `delay:5`, `fail_on:7`).

use super::{Emit, Transform};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoTransform {
    /// Pass the item through unchanged.
    Identity,
    /// `x * x`.
    Square,
    /// Drop odd items.
    KeepEven,
    /// Emit `x, x, ...` the given number of times.
    Expand(usize),
    /// Sleep, then pass through (simulated I/O).
    Delay(Duration),
    /// Fail on exactly this value, pass everything else through.
    FailOn(i64),
}

impl FromStr for DemoTransform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (s.trim(), None),
        };

        let transform = match (name, arg) {
            ("identity", None) => DemoTransform::Identity,
            ("square", None) => DemoTransform::Square,
            ("keep_even", None) => DemoTransform::KeepEven,
            ("expand", Some(n)) => DemoTransform::Expand(n.parse()?),
            ("delay", Some(ms)) => DemoTransform::Delay(Duration::from_millis(ms.parse()?)),
            ("fail_on", Some(v)) => DemoTransform::FailOn(v.parse()?),
            _ => bail!("Unknown transform '{}'", s),
        };
        Ok(transform)
    }
}

impl fmt::Display for DemoTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DemoTransform::Identity => write!(f, "identity"),
            DemoTransform::Square => write!(f, "square"),
            DemoTransform::KeepEven => write!(f, "keep_even"),
            DemoTransform::Expand(n) => write!(f, "expand:{}", n),
            DemoTransform::Delay(d) => write!(f, "delay:{}", d.as_millis()),
            DemoTransform::FailOn(v) => write!(f, "fail_on:{}", v),
        }
    }
}

#[async_trait]
impl Transform<i64, i64> for DemoTransform {
    async fn apply(&self, input: i64) -> Result<Emit<i64>> {
        let emitted = match *self {
            DemoTransform::Identity => Emit::One(input),
            DemoTransform::Square => Emit::One(
                input
                    .checked_mul(input)
                    .ok_or_else(|| anyhow::anyhow!("{} squared overflows", input))?,
            ),
            DemoTransform::KeepEven if input % 2 == 0 => Emit::One(input),
            DemoTransform::KeepEven => Emit::None,
            DemoTransform::Expand(n) => Emit::Many(vec![input; n]),
            DemoTransform::Delay(d) => {
                tokio::time::sleep(d).await;
                Emit::One(input)
            }
            DemoTransform::FailOn(bad) if input == bad => bail!("Rejected item {}", input),
            DemoTransform::FailOn(_) => Emit::One(input),
        };
        Ok(emitted)
    }
}
