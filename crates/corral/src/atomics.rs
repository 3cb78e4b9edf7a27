//! Typed atomic integers and monotone extrema.
//!
//! [`Atomic<T>`] gives one generic, sequentially consistent surface over the
//! std atomic integer types. [`AtomicMax`] and [`AtomicMin`] track the
//! largest (smallest) value ever observed and tell the observing thread
//! whether its write moved the extremum.

use std::fmt;
use std::sync::atomic::{
    AtomicBool, AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize, AtomicU8, AtomicU16,
    AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

/// An integer width with a matching std atomic.
pub trait Integer: Copy + Ord + Default + fmt::Debug + Send + Sync + 'static {
    type Repr: Send + Sync;

    const MIN: Self;
    const MAX: Self;

    fn new_repr(value: Self) -> Self::Repr;
    fn load(repr: &Self::Repr) -> Self;
    fn store(repr: &Self::Repr, value: Self);
    fn swap(repr: &Self::Repr, value: Self) -> Self;
    fn compare_exchange(repr: &Self::Repr, current: Self, new: Self) -> Result<Self, Self>;
    fn fetch_add(repr: &Self::Repr, value: Self) -> Self;
    fn fetch_sub(repr: &Self::Repr, value: Self) -> Self;
}

macro_rules! impl_integer {
    ($($int:ty => $atomic:ty),* $(,)?) => {$(
        impl Integer for $int {
            type Repr = $atomic;

            const MIN: Self = <$int>::MIN;
            const MAX: Self = <$int>::MAX;

            #[inline]
            fn new_repr(value: Self) -> $atomic {
                <$atomic>::new(value)
            }

            #[inline]
            fn load(repr: &$atomic) -> Self {
                repr.load(Ordering::SeqCst)
            }

            #[inline]
            fn store(repr: &$atomic, value: Self) {
                repr.store(value, Ordering::SeqCst)
            }

            #[inline]
            fn swap(repr: &$atomic, value: Self) -> Self {
                repr.swap(value, Ordering::SeqCst)
            }

            #[inline]
            fn compare_exchange(repr: &$atomic, current: Self, new: Self) -> Result<Self, Self> {
                repr.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            }

            #[inline]
            fn fetch_add(repr: &$atomic, value: Self) -> Self {
                repr.fetch_add(value, Ordering::SeqCst)
            }

            #[inline]
            fn fetch_sub(repr: &$atomic, value: Self) -> Self {
                repr.fetch_sub(value, Ordering::SeqCst)
            }
        }
    )*};
}

impl_integer!(
    u8 => AtomicU8,
    u16 => AtomicU16,
    u32 => AtomicU32,
    u64 => AtomicU64,
    usize => AtomicUsize,
    i8 => AtomicI8,
    i16 => AtomicI16,
    i32 => AtomicI32,
    i64 => AtomicI64,
    isize => AtomicIsize,
);

// ── Atomic<T> ────────────────────────────────────────────────────

/// A sequentially consistent atomic integer of width `T`.
pub struct Atomic<T: Integer>(T::Repr);

impl<T: Integer> Atomic<T> {
    pub fn new(value: T) -> Self {
        Self(T::new_repr(value))
    }

    pub fn load(&self) -> T {
        T::load(&self.0)
    }

    pub fn store(&self, value: T) {
        T::store(&self.0, value)
    }

    pub fn swap(&self, value: T) -> T {
        T::swap(&self.0, value)
    }

    pub fn compare_exchange(&self, current: T, new: T) -> Result<T, T> {
        T::compare_exchange(&self.0, current, new)
    }

    /// Adds and returns the previous value. Wraps on overflow.
    pub fn fetch_add(&self, value: T) -> T {
        T::fetch_add(&self.0, value)
    }

    /// Subtracts and returns the previous value. Wraps on overflow.
    pub fn fetch_sub(&self, value: T) -> T {
        T::fetch_sub(&self.0, value)
    }
}

impl<T: Integer> Default for Atomic<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Integer> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

// ── AtomicMax / AtomicMin ────────────────────────────────────────

/// The largest value ever observed. Writes never lower it.
///
/// An optional threshold makes smaller observations invisible. `has_value`
/// separates "nothing observed" from "observed the minimum value".
pub struct AtomicMax<T: Integer> {
    value: Atomic<T>,
    has_value: AtomicBool,
    threshold: Option<T>,
}

impl<T: Integer> AtomicMax<T> {
    pub fn new() -> Self {
        Self {
            value: Atomic::new(T::MIN),
            has_value: AtomicBool::new(false),
            threshold: None,
        }
    }

    /// Observations below `threshold` are ignored.
    pub fn with_threshold(threshold: T) -> Self {
        Self {
            threshold: Some(threshold),
            ..Self::new()
        }
    }

    /// Record `value`; returns true when it became the new maximum.
    pub fn observe(&self, value: T) -> bool {
        if self.threshold.is_some_and(|t| value < t) {
            return false;
        }
        if value == T::MIN {
            return !self.has_value.swap(true, Ordering::SeqCst) && self.value.load() == T::MIN;
        }
        let mut current = self.value.load();
        loop {
            if value <= current {
                return false;
            }
            match self.value.compare_exchange(current, value) {
                Ok(_) => {
                    self.has_value.store(true, Ordering::SeqCst);
                    return true;
                }
                Err(next) => current = next,
            }
        }
    }

    /// The maximum, or `None` when nothing at or above the threshold was observed.
    pub fn get(&self) -> Option<T> {
        self.has_value
            .load(Ordering::SeqCst)
            .then(|| self.value.load())
    }

    /// The maximum, or `T::MIN` when nothing was observed.
    pub fn load(&self) -> T {
        self.value.load()
    }

    pub fn threshold(&self) -> Option<T> {
        self.threshold
    }
}

impl<T: Integer> Default for AtomicMax<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Integer> fmt::Debug for AtomicMax<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicMax")
            .field("value", &self.get())
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// The smallest value ever observed. Writes never raise it.
///
/// Observations above the optional threshold are ignored.
pub struct AtomicMin<T: Integer> {
    value: Atomic<T>,
    has_value: AtomicBool,
    threshold: Option<T>,
}

impl<T: Integer> AtomicMin<T> {
    pub fn new() -> Self {
        Self {
            value: Atomic::new(T::MAX),
            has_value: AtomicBool::new(false),
            threshold: None,
        }
    }

    pub fn with_threshold(threshold: T) -> Self {
        Self {
            threshold: Some(threshold),
            ..Self::new()
        }
    }

    /// Record `value`; returns true when it became the new minimum.
    pub fn observe(&self, value: T) -> bool {
        if self.threshold.is_some_and(|t| value > t) {
            return false;
        }
        if value == T::MAX {
            return !self.has_value.swap(true, Ordering::SeqCst) && self.value.load() == T::MAX;
        }
        let mut current = self.value.load();
        loop {
            if value >= current {
                return false;
            }
            match self.value.compare_exchange(current, value) {
                Ok(_) => {
                    self.has_value.store(true, Ordering::SeqCst);
                    return true;
                }
                Err(next) => current = next,
            }
        }
    }

    pub fn get(&self) -> Option<T> {
        self.has_value
            .load(Ordering::SeqCst)
            .then(|| self.value.load())
    }

    /// The minimum, or `T::MAX` when nothing was observed.
    pub fn load(&self) -> T {
        self.value.load()
    }
}

impl<T: Integer> Default for AtomicMin<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Integer> fmt::Debug for AtomicMin<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicMin")
            .field("value", &self.get())
            .field("threshold", &self.threshold)
            .finish()
    }
}
