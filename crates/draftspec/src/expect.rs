//! The expectation library (C3): a small fluent assertion API.
//!
//! `Expectation<T>` is a single generic wrapper; each capability (equality,
//! ordering, string matching, collection membership, "did this throw")
//! is granted by a separate inherent `impl` block guarded by the trait bounds
//! that capability needs, rather than one trait-per-type hierarchy. A failing
//! check raises a [`SpecError::AssertionFailure`] via `panic_any` so the
//! executor's `catch_unwind` recovers the typed error instead of a bare
//! string (see `SpecError::from_panic`).

use std::fmt;

use regex::Regex;

use crate::error::SpecError;

/// Wraps a value under test together with the source text of the expression
/// that produced it (captured by the [`expect!`](crate::expect) macro via
/// `stringify!`, or `"value"` when constructed directly).
pub struct Expectation<T> {
    value: T,
    expression: &'static str,
}

/// Construct an expectation with the literal expression text `"value"`.
/// Prefer the [`expect!`](crate::expect) macro when the call site is
/// available, so assertion failures reference the real expression.
pub fn expect<T>(value: T) -> Expectation<T> {
    Expectation {
        value,
        expression: "value",
    }
}

/// Construct an expectation with an explicit expression label. Used by the
/// `expect!` macro; public so hand-rolled matchers can do the same.
pub fn expect_with_expr<T>(value: T, expression: &'static str) -> Expectation<T> {
    Expectation { value, expression }
}

/// Captures the source text of its argument via `stringify!` and builds an
/// [`Expectation`] labeled with it, so a failing assertion names the actual
/// expression rather than the generic word "value".
#[macro_export]
macro_rules! expect {
    ($e:expr) => {
        $crate::expect::expect_with_expr($e, stringify!($e))
    };
}

fn fail(expression: &str, expectation: impl Into<String>, actual: impl Into<String>) -> ! {
    std::panic::panic_any(SpecError::AssertionFailure {
        expression: expression.to_string(),
        expectation: expectation.into(),
        actual: actual.into(),
    })
}

// --- Generic: equality -----------------------------------------------------

impl<T: PartialEq + fmt::Debug> Expectation<T> {
    pub fn to_be(self, expected: T) {
        if self.value != expected {
            fail(
                self.expression,
                format!("be {expected:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_not_be(self, expected: T) {
        if self.value == expected {
            fail(
                self.expression,
                format!("not be {expected:?}"),
                format!("{:?}", self.value),
            );
        }
    }
}

// --- Generic: ordering -------------------------------------------------

impl<T: PartialOrd + fmt::Debug> Expectation<T> {
    pub fn to_be_greater_than(self, other: T) {
        if !(self.value > other) {
            fail(
                self.expression,
                format!("be greater than {other:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_be_less_than(self, other: T) {
        if !(self.value < other) {
            fail(
                self.expression,
                format!("be less than {other:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_be_at_least(self, other: T) {
        if !(self.value >= other) {
            fail(
                self.expression,
                format!("be at least {other:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_be_at_most(self, other: T) {
        if !(self.value <= other) {
            fail(
                self.expression,
                format!("be at most {other:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_be_in_range(self, min: T, max: T) {
        if !(self.value >= min && self.value <= max) {
            fail(
                self.expression,
                format!("be in range {min:?}..={max:?}"),
                format!("{:?}", self.value),
            );
        }
    }
}

// --- Generic: approximate numeric equality --------------------------------

impl<T: Into<f64> + Copy + fmt::Debug> Expectation<T> {
    pub fn to_be_close_to(self, expected: T, tolerance: T) {
        let (actual, expected_f, tolerance_f): (f64, f64, f64) =
            (self.value.into(), expected.into(), tolerance.into());
        if (actual - expected_f).abs() > tolerance_f {
            fail(
                self.expression,
                format!("be close to {expected:?} (+/- {tolerance:?})"),
                format!("{:?}", self.value),
            );
        }
    }
}

// --- Option: nullability ---------------------------------------------------

impl<T: fmt::Debug> Expectation<Option<T>> {
    pub fn to_be_null(self) {
        if let Some(v) = &self.value {
            fail(self.expression, "be null", format!("{v:?}"));
        }
    }

    pub fn to_not_be_null(self) {
        if self.value.is_none() {
            fail(self.expression, "not be null", "null");
        }
    }
}

// --- Boolean -----------------------------------------------------------

impl Expectation<bool> {
    pub fn to_be_true(self) {
        if !self.value {
            fail(self.expression, "be true", "false");
        }
    }

    pub fn to_be_false(self) {
        if self.value {
            fail(self.expression, "be false", "true");
        }
    }
}

// --- String --------------------------------------------------------------

impl Expectation<String> {
    pub fn to_contain(self, needle: &str) {
        if !self.value.contains(needle) {
            fail(
                self.expression,
                format!("contain {needle:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_start_with(self, prefix: &str) {
        if !self.value.starts_with(prefix) {
            fail(
                self.expression,
                format!("start with {prefix:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_end_with(self, suffix: &str) {
        if !self.value.ends_with(suffix) {
            fail(
                self.expression,
                format!("end with {suffix:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_be_null_or_empty(self) {
        if !self.value.is_empty() {
            fail(
                self.expression,
                "be null or empty",
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_match(self, pattern: &str) {
        let re = Regex::new(pattern).unwrap_or_else(|e| {
            panic!("invalid pattern passed to to_match: {e}");
        });
        if !re.is_match(&self.value) {
            fail(
                self.expression,
                format!("match /{pattern}/"),
                format!("{:?}", self.value),
            );
        }
    }
}

// --- Collection (Vec<U>) --------------------------------------------------

impl<U: PartialEq + fmt::Debug> Expectation<Vec<U>> {
    pub fn to_contain(self, item: &U) {
        if !self.value.iter().any(|v| v == item) {
            fail(
                self.expression,
                format!("contain {item:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_not_contain(self, item: &U) {
        if self.value.iter().any(|v| v == item) {
            fail(
                self.expression,
                format!("not contain {item:?}"),
                format!("{:?}", self.value),
            );
        }
    }

    pub fn to_contain_all(self, items: &[U]) {
        let missing: Vec<&U> = items.iter().filter(|i| !self.value.contains(i)).collect();
        if !missing.is_empty() {
            fail(
                self.expression,
                format!("contain all of {items:?}"),
                format!("{:?} (missing {missing:?})", self.value),
            );
        }
    }

    pub fn to_have_count(self, n: usize) {
        if self.value.len() != n {
            fail(
                self.expression,
                format!("have count {n}"),
                format!("{}", self.value.len()),
            );
        }
    }

    pub fn to_be_empty(self) {
        if !self.value.is_empty() {
            fail(self.expression, "be empty", format!("{:?}", self.value));
        }
    }

    pub fn to_not_be_empty(self) {
        if self.value.is_empty() {
            fail(self.expression, "not be empty", "[]");
        }
    }
}

// --- Action (panicking closures) ------------------------------------------

impl<F: FnOnce() + std::panic::UnwindSafe> Expectation<F> {
    /// Succeeds if the action panics, regardless of payload type.
    pub fn to_throw_any(self) {
        if std::panic::catch_unwind(self.value).is_ok() {
            fail(self.expression, "throw", "nothing was thrown");
        }
    }

    /// Succeeds only if the action panics with a payload of exactly type `E`
    /// (as raised via `std::panic::panic_any::<E>`).
    pub fn to_throw<E: 'static>(self) {
        match std::panic::catch_unwind(self.value) {
            Ok(()) => fail(
                self.expression,
                format!("throw {}", std::any::type_name::<E>()),
                "nothing was thrown",
            ),
            Err(payload) => {
                if !payload.is::<E>() {
                    fail(
                        self.expression,
                        format!("throw {}", std::any::type_name::<E>()),
                        "a different type was thrown",
                    );
                }
            }
        }
    }

    pub fn to_not_throw(self) {
        if let Err(payload) = std::panic::catch_unwind(self.value) {
            let message = SpecError::from_panic(payload).first_line();
            fail(self.expression, "not throw", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_passes_and_fails() {
        expect(2 + 2).to_be(4);
        let result = std::panic::catch_unwind(|| expect(2 + 2).to_be(5));
        assert!(result.is_err());
    }

    #[test]
    fn ordering_and_range() {
        expect(5).to_be_greater_than(1);
        expect(5).to_be_in_range(1, 10);
        let result = std::panic::catch_unwind(|| expect(5).to_be_in_range(6, 10));
        assert!(result.is_err());
    }

    #[test]
    fn string_matchers() {
        expect("hello world".to_string()).to_contain("world");
        expect("hello world".to_string()).to_start_with("hello");
        expect(String::new()).to_be_null_or_empty();
        expect("abc123".to_string()).to_match(r"^[a-z]+\d+$");
    }

    #[test]
    fn collection_matchers() {
        let items = vec![1, 2, 3];
        expect(items.clone()).to_contain(&2);
        expect(items.clone()).to_have_count(3);
        expect(items).to_contain_all(&[1, 3]);
        expect(Vec::<i32>::new()).to_be_empty();
    }

    #[test]
    fn option_matchers() {
        expect(None::<i32>).to_be_null();
        expect(Some(1)).to_not_be_null();
    }

    #[test]
    fn action_matchers() {
        expect(|| panic!("boom")).to_throw_any();
        expect(|| {}).to_not_throw();
    }

    #[test]
    fn failure_reports_expression_text() {
        let err = std::panic::catch_unwind(|| crate::expect!(1 + 1).to_be(5)).unwrap_err();
        let err = SpecError::from_panic(err);
        match err {
            SpecError::AssertionFailure { expression, .. } => assert_eq!(expression, "1 + 1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
