/*
Copyright (c) 2021 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! Values for match fields and action parameters, and their canonical
//! P4Runtime byte encoding.

use byteorder::{BigEndian, ByteOrder};
use std::fmt::{self, Display};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::P4Error;

/// An Ethernet address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = P4Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || P4Error::InvalidValue(format!("\"{}\" is not an Ethernet address", s));
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddr(octets))
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

/// A value to be encoded into a field of known bit width.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Int(u128),
    /// Big-endian bytes, for fields wider than 128 bits.
    Bytes(Vec<u8>),
}

macro_rules! value_from_uint {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(x: $t) -> Self {
                Value::Int(x.into())
            }
        })*
    };
}

value_from_uint!(u8, u16, u32, u64, u128);

impl From<Ipv4Addr> for Value {
    fn from(addr: Ipv4Addr) -> Self {
        Value::Int(u32::from(addr).into())
    }
}

impl From<Ipv6Addr> for Value {
    fn from(addr: Ipv6Addr) -> Self {
        Value::Int(u128::from(addr))
    }
}

impl From<MacAddr> for Value {
    fn from(mac: MacAddr) -> Self {
        Value::Bytes(mac.0.to_vec())
    }
}

/// Accepts the notations an operator would type: decimal, `0x` hex, dotted
/// IPv4, IPv6, and colon- or dash-separated Ethernet addresses.
impl FromStr for Value {
    type Err = P4Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return parse_hex(hex).ok_or_else(|| P4Error::InvalidValue(format!("\"{}\" is not a hex number", s)));
        }
        if let Ok(x) = s.parse::<u128>() {
            return Ok(Value::Int(x));
        }
        if let Ok(addr) = s.parse::<Ipv4Addr>() {
            return Ok(addr.into());
        }
        if let Ok(mac) = s.parse::<MacAddr>() {
            return Ok(mac.into());
        }
        if let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(addr.into());
        }
        Err(P4Error::InvalidValue(format!("cannot parse \"{}\"", s)))
    }
}

fn parse_hex(digits: &str) -> Option<Value> {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    if digits.len() <= 32 {
        return u128::from_str_radix(digits, 16).ok().map(Value::Int);
    }
    // Left-pad to whole bytes, then decode pairwise.
    let padded = if digits.len() % 2 == 1 {
        format!("0{}", digits)
    } else {
        digits.to_string()
    };
    (0..padded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&padded[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()
        .map(Value::Bytes)
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(x) => write!(f, "{}", x),
            Value::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl Value {
    fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            Value::Int(x) => {
                let mut buf = [0u8; 16];
                BigEndian::write_u128(&mut buf, *x);
                buf.to_vec()
            }
            Value::Bytes(b) => b.clone(),
        }
    }

    /// Encodes the value as exactly `ceil(bit_width / 8)` big-endian bytes,
    /// failing if it needs more than `bit_width` bits.
    pub fn encode(&self, bit_width: u32) -> Result<Vec<u8>, P4Error> {
        let raw = self.to_be_bytes();
        let first = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        let significant = &raw[first..];
        let bits = match significant.first() {
            Some(b) => (significant.len() as u32 - 1) * 8 + (8 - b.leading_zeros()),
            None => 0,
        };
        if bits > bit_width {
            return Err(P4Error::InvalidValue(format!(
                "{} does not fit in {} bits",
                self, bit_width
            )));
        }
        let num_bytes = ((bit_width + 7) / 8) as usize;
        let mut encoded = vec![0u8; num_bytes - significant.len()];
        encoded.extend_from_slice(significant);
        Ok(encoded)
    }
}

/// Decodes canonical bytes back to an integer, when they fit.
pub fn decode_uint(bytes: &[u8]) -> Option<u128> {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    let significant = &bytes[first..];
    match significant.len() {
        0 => Some(0),
        n if n <= 16 => Some(BigEndian::read_uint128(significant, n)),
        _ => None,
    }
}

/// Keeps the leading `prefix_len` bits of a `bit_width`-bit field and zeros
/// the rest.
pub(crate) fn mask_to_prefix(value: &mut [u8], bit_width: u32, prefix_len: u32) {
    let keep = value.len() as u32 * 8 - bit_width + prefix_len;
    for (i, byte) in value.iter_mut().enumerate() {
        let start = i as u32 * 8;
        if start >= keep {
            *byte = 0;
        } else if start + 8 > keep {
            *byte &= 0xffu8 << (start + 8 - keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_notations() {
        assert_eq!("42".parse::<Value>().unwrap(), Value::Int(42));
        assert_eq!("0x0a".parse::<Value>().unwrap(), Value::Int(10));
        assert_eq!("10.0.1.1".parse::<Value>().unwrap(), Value::Int(0x0a00_0101));
        assert_eq!(
            "00:00:00:00:01:01".parse::<Value>().unwrap(),
            Value::Bytes(vec![0, 0, 0, 0, 1, 1])
        );
        assert_eq!("::1".parse::<Value>().unwrap(), Value::Int(1));
        assert!("10.0.1".parse::<Value>().is_err());
        assert!("0xzz".parse::<Value>().is_err());
    }

    #[test]
    fn encode_is_width_exact() {
        assert_eq!(Value::Int(1).encode(9).unwrap(), vec![0, 1]);
        assert_eq!(Value::Int(0x0a00_0101).encode(32).unwrap(), vec![10, 0, 1, 1]);
        assert_eq!(Value::Int(0).encode(16).unwrap(), vec![0, 0]);
        assert_eq!(Value::Int(511).encode(9).unwrap(), vec![1, 0xff]);
        assert!(Value::Int(512).encode(9).is_err());
        assert_eq!(
            Value::Bytes(vec![0, 0, 0xab]).encode(8).unwrap(),
            vec![0xab]
        );
    }

    #[test]
    fn prefix_masking() {
        let mut v = vec![10, 0, 1, 1];
        mask_to_prefix(&mut v, 32, 24);
        assert_eq!(v, vec![10, 0, 1, 0]);

        let mut v = vec![0x0f, 0xff];
        mask_to_prefix(&mut v, 12, 4);
        assert_eq!(v, vec![0x0f, 0x00]);
    }

    #[test]
    fn mac_display() {
        let mac: MacAddr = "00-00-00-00-02-0A".parse().unwrap();
        assert_eq!(mac.to_string(), "00:00:00:00:02:0a");
        assert!("00:00:00:00:02".parse::<MacAddr>().is_err());
    }
}
