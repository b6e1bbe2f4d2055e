use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// Packet size used to convert a bandwidth-delay product into packets.
pub const MTU_BYTES: u64 = 1500;

/// Rate and round-trip time of one emulated bottleneck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    pub rate_mbps: u32,
    pub rtt_ms: u32,
}

impl LinkParams {
    pub fn new(rate_mbps: u32, rtt_ms: u32) -> Self {
        Self { rate_mbps, rtt_ms }
    }

    /// `mm-delay` applies its delay in each direction, so it gets half the RTT.
    pub fn one_way_delay_ms(&self) -> u32 {
        self.rtt_ms / 2
    }

    /// Packets in flight on a full link: `floor(rate_bytes/s * rtt_s / MTU)`.
    ///
    /// Computed in integers so the floor is exact.
    pub fn bdp_packets(&self) -> u64 {
        let bits_per_sec = u64::from(self.rate_mbps) * 1_000_000;
        bits_per_sec * u64::from(self.rtt_ms) / (8 * 1000 * MTU_BYTES)
    }
}

impl fmt::Display for LinkParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Mbps/{}ms", self.rate_mbps, self.rtt_ms)
    }
}

/// Queue depth expressed in bandwidth-delay products.
///
/// Deserializes from an integer or the string `"inf"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDepth {
    Bdp(u32),
    /// Leave the queue at the emulator's default (unbounded) size.
    Unbounded,
}

impl BufferDepth {
    /// Buffer size in packets, or `None` for an unbounded queue.
    pub fn packets(&self, link: &LinkParams) -> Option<u64> {
        match self {
            BufferDepth::Bdp(n) => Some(u64::from(*n) * link.bdp_packets()),
            BufferDepth::Unbounded => None,
        }
    }
}

impl fmt::Display for BufferDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferDepth::Bdp(n) => write!(f, "{n}"),
            BufferDepth::Unbounded => f.write_str("inf"),
        }
    }
}

impl<'de> Deserialize<'de> for BufferDepth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DepthVisitor;

        impl Visitor<'_> for DepthVisitor {
            type Value = BufferDepth;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative number of BDPs or \"inf\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<BufferDepth, E> {
                u32::try_from(v)
                    .map(BufferDepth::Bdp)
                    .map_err(|_| E::custom(format!("buffer depth {v} is too large")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<BufferDepth, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("buffer depth {v} is negative")))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<BufferDepth, E> {
                match v {
                    "inf" => Ok(BufferDepth::Unbounded),
                    other => other
                        .parse::<u32>()
                        .map(BufferDepth::Bdp)
                        .map_err(|_| E::custom(format!("invalid buffer depth '{other}'"))),
                }
            }
        }

        deserializer.deserialize_any(DepthVisitor)
    }
}
