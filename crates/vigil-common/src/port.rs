//! Optional transport ports.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A transport port that may be omitted.
///
/// L3 services balance whole addresses and carry no port, so the port is
/// part of several key types yet optional. It is kept as a signed value with
/// every negative collapsed to [`Port::OMITTED`]; port `0` is a real value
/// and is distinct from an omitted port, both in keys and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port(i32);

impl Port {
    /// Sentinel for a port that was not specified.
    pub const OMITTED: Port = Port(-1);

    /// Creates a concrete port.
    pub fn new(value: u16) -> Self {
        Port(value as i32)
    }

    /// Whether the port was omitted.
    pub fn is_omitted(self) -> bool {
        self.0 < 0
    }

    /// The port number to use when building a socket address. An omitted
    /// port maps to 0, which asks the system to pick one.
    pub fn value(self) -> u16 {
        if self.0 < 0 {
            0
        } else {
            self.0 as u16
        }
    }

    /// The port as an optional value for wire encodings that must keep
    /// "absent" distinguishable from zero.
    pub fn as_option(self) -> Option<u16> {
        if self.0 < 0 {
            None
        } else {
            Some(self.0 as u16)
        }
    }
}

impl Default for Port {
    fn default() -> Self {
        Self::OMITTED
    }
}

impl From<u16> for Port {
    fn from(value: u16) -> Self {
        Port::new(value)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            Ok(())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for Port {
    type Err = ParseIntError;

    /// Parses a port, treating the empty string as omitted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::OMITTED);
        }
        s.parse::<u16>().map(Port::new)
    }
}

impl Serialize for Port {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_option() {
            Some(port) => serializer.serialize_u16(port),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Port {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PortVisitor;

        impl<'a> de::Visitor<'a> for PortVisitor {
            type Value = Port;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a port number, a string, or null")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Port, E> {
                u16::try_from(value)
                    .map(Port::new)
                    .map_err(|_| E::custom(format!("port {value} out of range")))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Port, E> {
                u16::try_from(value)
                    .map(Port::new)
                    .map_err(|_| E::custom(format!("port {value} out of range")))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Port, E> {
                value
                    .parse()
                    .map_err(|err| E::custom(format!("invalid port {value:?}: {err}")))
            }

            fn visit_none<E: de::Error>(self) -> Result<Port, E> {
                Ok(Port::OMITTED)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Port, E> {
                Ok(Port::OMITTED)
            }

            fn visit_some<D: Deserializer<'a>>(self, d: D) -> Result<Port, D::Error> {
                d.deserialize_any(PortVisitor)
            }
        }

        deserializer.deserialize_any(PortVisitor)
    }
}
