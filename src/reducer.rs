//! Streaming reducers over nullable numbers.
//!
//! Every reducer is a fold with four steps: create an empty state, accumulate values into
//! it, combine two partial states (left is earlier in time), and finish into an optional
//! [`Value`]. The same reducers run on two arithmetic tracks: `f64` and arbitrary precision
//! [`BigDecimal`].

use crate::{Number, Result, TslabError};
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::num::NonZeroU64;
use std::str::FromStr;

/// The reduction applied to a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reducer {
    Count,
    CountDistinct,
    First,
    Last,
    Minimum,
    Maximum,
    Sum,
    SquareSum,
    Average,
    Median,
    Mode,
}

impl Reducer {
    pub const ALL: [Reducer; 11] = [
        Reducer::Count,
        Reducer::CountDistinct,
        Reducer::First,
        Reducer::Last,
        Reducer::Minimum,
        Reducer::Maximum,
        Reducer::Sum,
        Reducer::SquareSum,
        Reducer::Average,
        Reducer::Median,
        Reducer::Mode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Reducer::Count => "COUNT",
            Reducer::CountDistinct => "COUNT_DISTINCT",
            Reducer::First => "FIRST",
            Reducer::Last => "LAST",
            Reducer::Minimum => "MINIMUM",
            Reducer::Maximum => "MAXIMUM",
            Reducer::Sum => "SUM",
            Reducer::SquareSum => "SQUARE_SUM",
            Reducer::Average => "AVERAGE",
            Reducer::Median => "MEDIAN",
            Reducer::Mode => "MODE",
        }
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Reducer {
    type Err = TslabError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Reducer::ALL
            .into_iter()
            .find(|reducer| reducer.name() == normalized)
            .ok_or_else(|| TslabError::UnknownReducer(s.to_string()))
    }
}

/// Arithmetic track of a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrecisionMode {
    #[default]
    Double,
    Decimal,
}

/// A reduced value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Double(f64),
    Decimal(BigDecimal),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Double(v) => *v,
            Value::Decimal(v) => v.to_f64().unwrap_or(f64::NAN),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
        }
    }
}

/// Operations a reducer needs from its number type.
pub trait Arithmetic: Clone + Send + fmt::Debug + 'static {
    /// Identity used for distinct counting and mode.
    type Key: Eq + Hash + Clone + fmt::Debug;

    fn from_number(value: Number) -> Option<Self>;
    fn from_value(value: &Value) -> Option<Self>;
    fn from_count(count: usize) -> Self;
    fn into_value(self) -> Value;

    fn plus(&self, other: &Self) -> Self;
    fn squared(&self) -> Self;
    fn compare(&self, other: &Self) -> Ordering;
    fn key(&self) -> Self::Key;
    /// Significant digits; zero on tracks without a precision notion.
    fn precision(&self) -> u64;

    /// `sum / count`, given the largest precision seen among the inputs.
    fn mean(sum: &Self, count: usize, input_precision: u64) -> Self;
    /// Mean of two values.
    fn midpoint(a: &Self, b: &Self) -> Self;
}

impl Arithmetic for f64 {
    type Key = u64;

    fn from_number(value: Number) -> Option<Self> {
        let value = value.as_f64();
        (!value.is_nan()).then_some(value)
    }

    fn from_value(value: &Value) -> Option<Self> {
        let value = value.as_f64();
        (!value.is_nan()).then_some(value)
    }

    fn from_count(count: usize) -> Self {
        count as f64
    }

    fn into_value(self) -> Value {
        Value::Double(self)
    }

    fn plus(&self, other: &Self) -> Self {
        self + other
    }

    fn squared(&self) -> Self {
        self * self
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }

    fn key(&self) -> u64 {
        // -0.0 and 0.0 are the same value.
        if *self == 0.0 { 0 } else { self.to_bits() }
    }

    fn precision(&self) -> u64 {
        0
    }

    fn mean(sum: &Self, count: usize, _input_precision: u64) -> Self {
        sum / count as f64
    }

    fn midpoint(a: &Self, b: &Self) -> Self {
        (a + b) / 2.0
    }
}

fn decimal_from_f64(value: f64) -> Option<BigDecimal> {
    if !value.is_finite() {
        return None;
    }
    // The shortest round-trip representation, not the exact binary expansion.
    BigDecimal::from_str(&value.to_string()).ok()
}

fn round_to(value: BigDecimal, precision: u64) -> BigDecimal {
    let precision = NonZeroU64::new(precision).unwrap_or(NonZeroU64::MIN);
    value.with_precision_round(precision, RoundingMode::HalfUp)
}

impl Arithmetic for BigDecimal {
    type Key = BigDecimal;

    fn from_number(value: Number) -> Option<Self> {
        match value {
            Number::Int(v) => Some(BigDecimal::from(v)),
            Number::Float(v) => decimal_from_f64(v),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Double(v) => decimal_from_f64(*v),
            Value::Decimal(v) => Some(v.clone()),
        }
    }

    fn from_count(count: usize) -> Self {
        BigDecimal::from(count as u64)
    }

    fn into_value(self) -> Value {
        Value::Decimal(self)
    }

    fn plus(&self, other: &Self) -> Self {
        self + other
    }

    fn squared(&self) -> Self {
        self * self
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    fn key(&self) -> BigDecimal {
        self.normalized()
    }

    fn precision(&self) -> u64 {
        self.digits()
    }

    fn mean(sum: &Self, count: usize, input_precision: u64) -> Self {
        let count = BigDecimal::from(count as u64);
        let precision = input_precision.max(count.digits()).max(sum.digits());
        round_to(sum / &count, precision)
    }

    fn midpoint(a: &Self, b: &Self) -> Self {
        let sum = a + b;
        let precision = sum.digits().max(1);
        round_to(sum / BigDecimal::from(2), precision)
    }
}

/// Occurrence counts in first-seen order.
#[derive(Debug, Clone)]
pub struct ModeCounter<A: Arithmetic> {
    index: HashMap<A::Key, usize>,
    entries: Vec<(A, usize)>,
    total: usize,
}

impl<A: Arithmetic> Default for ModeCounter<A> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
            total: 0,
        }
    }
}

impl<A: Arithmetic> ModeCounter<A> {
    fn add(&mut self, value: A, count: usize) {
        match self.index.get(&value.key()) {
            Some(&i) => self.entries[i].1 += count,
            None => {
                self.index.insert(value.key(), self.entries.len());
                self.entries.push((value, count));
            }
        }
        self.total += count;
    }

    fn merge(&mut self, other: ModeCounter<A>) {
        for (value, count) in other.entries {
            self.add(value, count);
        }
    }

    /// Fewer than three values: the first one. Otherwise the most frequent, ties going to
    /// the value seen first.
    fn finish(self) -> Option<A> {
        if self.total < 3 {
            return self.entries.into_iter().next().map(|(value, _)| value);
        }
        let mut best: Option<(A, usize)> = None;
        for (value, count) in self.entries {
            if best.as_ref().is_none_or(|(_, best_count)| count > *best_count) {
                best = Some((value, count));
            }
        }
        best.map(|(value, _)| value)
    }
}

/// Partial state of one reducer.
#[derive(Debug, Clone)]
pub enum Accumulator<A: Arithmetic> {
    Count(usize),
    Distinct(HashSet<A::Key>),
    First(Option<A>),
    Last(Option<A>),
    Minimum(Option<A>),
    Maximum(Option<A>),
    Sum(Option<A>),
    SquareSum(Option<A>),
    Average {
        sum: Option<A>,
        count: usize,
        precision: u64,
    },
    Median(Vec<A>),
    Mode(ModeCounter<A>),
}

fn merge_with<A>(left: Option<A>, right: Option<A>, f: impl FnOnce(A, A) -> A) -> Option<A> {
    match (left, right) {
        (Some(l), Some(r)) => Some(f(l, r)),
        (l, r) => l.or(r),
    }
}

fn smaller<A: Arithmetic>(a: A, b: A) -> A {
    if b.compare(&a) == Ordering::Less { b } else { a }
}

fn larger<A: Arithmetic>(a: A, b: A) -> A {
    if b.compare(&a) == Ordering::Greater { b } else { a }
}

impl<A: Arithmetic> Accumulator<A> {
    pub fn new(reducer: Reducer) -> Self {
        match reducer {
            Reducer::Count => Accumulator::Count(0),
            Reducer::CountDistinct => Accumulator::Distinct(HashSet::new()),
            Reducer::First => Accumulator::First(None),
            Reducer::Last => Accumulator::Last(None),
            Reducer::Minimum => Accumulator::Minimum(None),
            Reducer::Maximum => Accumulator::Maximum(None),
            Reducer::Sum => Accumulator::Sum(None),
            Reducer::SquareSum => Accumulator::SquareSum(None),
            Reducer::Average => Accumulator::Average {
                sum: None,
                count: 0,
                precision: 0,
            },
            Reducer::Median => Accumulator::Median(Vec::new()),
            Reducer::Mode => Accumulator::Mode(ModeCounter::default()),
        }
    }

    pub fn accumulate(&mut self, value: A) {
        match self {
            Accumulator::Count(count) => *count += 1,
            Accumulator::Distinct(seen) => {
                seen.insert(value.key());
            }
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            Accumulator::Last(last) => *last = Some(value),
            Accumulator::Minimum(min) => *min = merge_with(min.take(), Some(value), smaller),
            Accumulator::Maximum(max) => *max = merge_with(max.take(), Some(value), larger),
            Accumulator::Sum(sum) => *sum = merge_with(sum.take(), Some(value), |a, b| a.plus(&b)),
            Accumulator::SquareSum(sum) => {
                *sum = merge_with(sum.take(), Some(value.squared()), |a, b| a.plus(&b))
            }
            Accumulator::Average {
                sum,
                count,
                precision,
            } => {
                *precision = (*precision).max(value.precision());
                *sum = merge_with(sum.take(), Some(value), |a, b| a.plus(&b));
                *count += 1;
            }
            Accumulator::Median(values) => values.push(value),
            Accumulator::Mode(counter) => counter.add(value, 1),
        }
    }

    /// Merges `other`, which covers values after those of `self`.
    pub fn combine(self, other: Self) -> Self {
        use Accumulator::*;
        match (self, other) {
            (Count(a), Count(b)) => Count(a + b),
            (Distinct(mut a), Distinct(b)) => {
                a.extend(b);
                Distinct(a)
            }
            (First(a), First(b)) => First(a.or(b)),
            (Last(a), Last(b)) => Last(b.or(a)),
            (Minimum(a), Minimum(b)) => Minimum(merge_with(a, b, smaller)),
            (Maximum(a), Maximum(b)) => Maximum(merge_with(a, b, larger)),
            (Sum(a), Sum(b)) => Sum(merge_with(a, b, |a, b| a.plus(&b))),
            (SquareSum(a), SquareSum(b)) => SquareSum(merge_with(a, b, |a, b| a.plus(&b))),
            (
                Average {
                    sum: a,
                    count: n,
                    precision: p,
                },
                Average {
                    sum: b,
                    count: m,
                    precision: q,
                },
            ) => Average {
                sum: merge_with(a, b, |a, b| a.plus(&b)),
                count: n + m,
                precision: p.max(q),
            },
            (Median(mut a), Median(b)) => {
                a.extend(b);
                Median(a)
            }
            (Mode(mut a), Mode(b)) => {
                a.merge(b);
                Mode(a)
            }
            // States of different reducers never meet.
            (left, _) => left,
        }
    }

    /// Final value; `None` when nothing was accumulated.
    pub fn finish(self) -> Option<Value> {
        let result = match self {
            Accumulator::Count(0) => None,
            Accumulator::Count(count) => Some(A::from_count(count)),
            Accumulator::Distinct(seen) if seen.is_empty() => None,
            Accumulator::Distinct(seen) => Some(A::from_count(seen.len())),
            Accumulator::First(value)
            | Accumulator::Last(value)
            | Accumulator::Minimum(value)
            | Accumulator::Maximum(value)
            | Accumulator::Sum(value)
            | Accumulator::SquareSum(value) => value,
            Accumulator::Average {
                sum,
                count,
                precision,
            } => sum.map(|sum| A::mean(&sum, count, precision)),
            Accumulator::Median(mut values) => {
                values.sort_by(|a, b| a.compare(b));
                let n = values.len();
                match n {
                    0 => None,
                    _ if n % 2 == 1 => Some(values.swap_remove(n / 2)),
                    _ => Some(A::midpoint(&values[n / 2 - 1], &values[n / 2])),
                }
            }
            Accumulator::Mode(counter) => counter.finish(),
        };
        result.map(A::into_value)
    }
}

/// A mutable reduction contract in the supplier/accumulate/combine/finish form.
pub trait Collector {
    type Input;
    type State;
    type Output;

    fn supplier(&self) -> Self::State;
    fn accumulate(&self, state: &mut Self::State, value: Self::Input);
    fn combine(&self, left: Self::State, right: Self::State) -> Self::State;
    fn finish(&self, state: Self::State) -> Option<Self::Output>;
}

/// A [`Reducer`] on a fixed arithmetic track.
#[derive(Debug, Clone, Copy)]
pub struct ReducerCollector<A> {
    reducer: Reducer,
    _track: PhantomData<fn() -> A>,
}

impl<A: Arithmetic> ReducerCollector<A> {
    pub fn new(reducer: Reducer) -> Self {
        Self {
            reducer,
            _track: PhantomData,
        }
    }
}

impl<A: Arithmetic> Collector for ReducerCollector<A> {
    type Input = A;
    type State = Accumulator<A>;
    type Output = Value;

    fn supplier(&self) -> Accumulator<A> {
        Accumulator::new(self.reducer)
    }

    fn accumulate(&self, state: &mut Accumulator<A>, value: A) {
        state.accumulate(value);
    }

    fn combine(&self, left: Accumulator<A>, right: Accumulator<A>) -> Accumulator<A> {
        left.combine(right)
    }

    fn finish(&self, state: Accumulator<A>) -> Option<Value> {
        state.finish()
    }
}

/// Null handling ahead of every reducer: nulls take the fallback when one is configured and
/// are dropped otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NullPolicy {
    pub fallback: Option<Number>,
}

impl NullPolicy {
    pub fn new(fallback: Option<Number>) -> Self {
        Self { fallback }
    }

    pub fn apply(&self, value: Option<Number>) -> Option<Number> {
        value.filter(|v| !v.is_nan()).or(self.fallback)
    }
}

/// Partial state of a [`Reduction`], on either track.
#[derive(Debug, Clone)]
pub enum PartialReduction {
    Double(Accumulator<f64>),
    Decimal(Accumulator<BigDecimal>),
}

/// A reducer bound to a precision mode and a null policy.
#[derive(Debug, Clone, Copy)]
pub struct Reduction {
    reducer: Reducer,
    precision: PrecisionMode,
    policy: NullPolicy,
}

impl Reduction {
    pub fn new(reducer: Reducer, precision: PrecisionMode, policy: NullPolicy) -> Self {
        Self {
            reducer,
            precision,
            policy,
        }
    }

    pub fn reducer(&self) -> Reducer {
        self.reducer
    }

    pub fn supplier(&self) -> PartialReduction {
        match self.precision {
            PrecisionMode::Double => {
                PartialReduction::Double(ReducerCollector::<f64>::new(self.reducer).supplier())
            }
            PrecisionMode::Decimal => PartialReduction::Decimal(
                ReducerCollector::<BigDecimal>::new(self.reducer).supplier(),
            ),
        }
    }

    /// Accumulates a decoded slot value.
    pub fn accumulate(&self, state: &mut PartialReduction, value: Option<Number>) {
        let Some(value) = self.policy.apply(value) else {
            return;
        };
        match state {
            PartialReduction::Double(acc) => {
                if let Some(v) = f64::from_number(value) {
                    ReducerCollector::<f64>::new(self.reducer).accumulate(acc, v);
                }
            }
            PartialReduction::Decimal(acc) => {
                if let Some(v) = BigDecimal::from_number(value) {
                    ReducerCollector::<BigDecimal>::new(self.reducer).accumulate(acc, v);
                }
            }
        }
    }

    /// Accumulates an already reduced value, as when folding across series.
    pub fn accumulate_value(&self, state: &mut PartialReduction, value: Option<&Value>) {
        let fallback = self.policy.fallback;
        match state {
            PartialReduction::Double(acc) => {
                let v = value
                    .and_then(f64::from_value)
                    .or_else(|| fallback.and_then(f64::from_number));
                if let Some(v) = v {
                    acc.accumulate(v);
                }
            }
            PartialReduction::Decimal(acc) => {
                let v = value
                    .and_then(BigDecimal::from_value)
                    .or_else(|| fallback.and_then(BigDecimal::from_number));
                if let Some(v) = v {
                    acc.accumulate(v);
                }
            }
        }
    }

    pub fn combine(&self, left: PartialReduction, right: PartialReduction) -> PartialReduction {
        match (left, right) {
            (PartialReduction::Double(a), PartialReduction::Double(b)) => {
                PartialReduction::Double(ReducerCollector::<f64>::new(self.reducer).combine(a, b))
            }
            (PartialReduction::Decimal(a), PartialReduction::Decimal(b)) => {
                PartialReduction::Decimal(
                    ReducerCollector::<BigDecimal>::new(self.reducer).combine(a, b),
                )
            }
            (left, _) => left,
        }
    }

    pub fn finish(&self, state: PartialReduction) -> Option<Value> {
        match state {
            PartialReduction::Double(acc) => ReducerCollector::<f64>::new(self.reducer).finish(acc),
            PartialReduction::Decimal(acc) => {
                ReducerCollector::<BigDecimal>::new(self.reducer).finish(acc)
            }
        }
    }

    /// Reduces a sequence of slot values in one pass.
    pub fn reduce(&self, values: impl IntoIterator<Item = Option<Number>>) -> Option<Value> {
        let mut state = self.supplier();
        for value in values {
            self.accumulate(&mut state, value);
        }
        self.finish(state)
    }
}

/// Reduces `values` on the double track, dropping nulls.
pub fn reduce(reducer: Reducer, values: impl IntoIterator<Item = Option<Number>>) -> Option<Value> {
    Reduction::new(reducer, PrecisionMode::Double, NullPolicy::default()).reduce(values)
}
