//! Context switch tracking utilities.
//!
//! Those are mostly used for testing.

use crate::fiber::Runtime;

/// Calls a function and checks whether it yielded.
///
/// # Example
///
/// ```no_run
/// # let rt = fibrio::fiber::Runtime::new().unwrap();
/// use fibrio::fiber::{check_yield, YieldResult};
/// use std::time::Duration;
///
/// assert_eq!(
///     check_yield(&rt, || ()),
///     YieldResult::DidntYield(())
/// );
/// ```
pub fn check_yield<F, T>(rt: &Runtime, f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let csw_before = rt.csw();
    let res = f();
    if rt.csw() == csw_before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function didn't yield.
    DidntYield(T),
    /// The function did yield.
    Yielded(T),
}
