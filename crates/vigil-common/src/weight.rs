//! Signed weight values with an explicit "omitted" sentinel.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A real-server weight.
///
/// All negative values are collapsed into the single [`Weight::OMITTED`]
/// sentinel, which means "no information". Zero is a valid weight: a real
/// with weight zero stays present in the balancer but receives no traffic,
/// which is how inhibit-on-failure drains a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Weight(i32);

impl Weight {
    /// Sentinel for a weight that was not specified.
    pub const OMITTED: Weight = Weight(-1);

    /// Zero weight: enabled, but drained.
    pub const ZERO: Weight = Weight(0);

    /// Creates a weight. Negative inputs normalize to [`Weight::OMITTED`].
    pub fn new(value: i32) -> Self {
        if value < 0 {
            Self::OMITTED
        } else {
            Weight(value)
        }
    }

    /// Whether this weight carries no information.
    pub fn is_omitted(self) -> bool {
        self.0 < 0
    }

    /// Raw signed value, `-1` when omitted.
    pub fn value(self) -> i32 {
        self.0
    }

    /// The weight as an unsigned value, with omitted mapping to zero.
    pub fn as_u32(self) -> u32 {
        if self.0 < 0 {
            0
        } else {
            self.0 as u32
        }
    }

    /// Moves from `old` towards `self` by a percentage-bounded step and
    /// returns the reached value.
    ///
    /// The step is `old * coeff / 100` with a minimum of 1, so a backend
    /// ramps up or down gradually instead of jumping to the advertised
    /// target at once. Corner cases:
    ///
    ///   * both omitted — omitted;
    ///   * `self` omitted — `old` is kept;
    ///   * `old` omitted — `self` is taken directly;
    ///   * `coeff == 0` — `self` is taken directly.
    pub fn recalculate(self, old: Weight, coeff: u32) -> Weight {
        if self.is_omitted() && old.is_omitted() {
            return Self::OMITTED;
        }
        if self.is_omitted() {
            return old;
        }
        if old.is_omitted() {
            return self;
        }

        if coeff == 0 {
            return self;
        }

        let old_value = old.0;
        let mut step = old_value * coeff as i32 / 100;
        if step == 0 {
            step = 1;
        }

        if self > old {
            Weight(old_value + step).min(self)
        } else {
            Weight(old_value - step).max(self)
        }
    }
}

impl Default for Weight {
    fn default() -> Self {
        Self::OMITTED
    }
}

impl From<i32> for Weight {
    fn from(value: i32) -> Self {
        Weight::new(value)
    }
}

impl Add for Weight {
    type Output = Weight;

    fn add(self, rhs: Weight) -> Weight {
        Weight(self.0 + rhs.0)
    }
}

impl Sub for Weight {
    type Output = Weight;

    fn sub(self, rhs: Weight) -> Weight {
        Weight(self.0 - rhs.0)
    }
}

impl AddAssign for Weight {
    fn add_assign(&mut self, rhs: Weight) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Weight {
    fn sub_assign(&mut self, rhs: Weight) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            Ok(())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for Weight {
    type Err = std::convert::Infallible;

    /// Parses a textual weight. Unparsable or negative input yields
    /// [`Weight::OMITTED`] rather than an error, matching the forgiving
    /// handling of weights received from probed backends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i32>() {
            Ok(value) if value >= 0 => Ok(Weight(value)),
            _ => Ok(Self::OMITTED),
        }
    }
}

impl Serialize for Weight {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_omitted() {
            serializer.serialize_none()
        } else {
            serializer.serialize_i32(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Weight {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct WeightVisitor;

        impl<'a> de::Visitor<'a> for WeightVisitor {
            type Value = Weight;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer weight, a string, or null")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Weight, E> {
                Ok(Weight::new(value.clamp(i32::MIN as i64, i32::MAX as i64) as i32))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Weight, E> {
                Ok(Weight::new(value.min(i32::MAX as u64) as i32))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Weight, E> {
                Ok(value.parse().expect("weight parsing is infallible"))
            }

            fn visit_none<E: de::Error>(self) -> Result<Weight, E> {
                Ok(Weight::OMITTED)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Weight, E> {
                Ok(Weight::OMITTED)
            }

            fn visit_some<D: Deserializer<'a>>(self, d: D) -> Result<Weight, D::Error> {
                d.deserialize_any(WeightVisitor)
            }
        }

        deserializer.deserialize_any(WeightVisitor)
    }
}
