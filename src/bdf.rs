use crate::error::Error;
use alloc::format;
use alloc::string::{String, ToString};
use core::fmt;

/// A PCIe bus:device.function identifier, optionally carrying a namespace ID
/// (`"bb:dd.f"` or `"bb:dd.f/nsid"`, `nsid` defaulting to 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub nsid: u32,
}

impl Bdf {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (address, nsid) = match s.split_once('/') {
            Some((address, nsid)) => {
                let nsid = nsid
                    .parse::<u32>()
                    .map_err(|_| Error::InvalidBdf(s.to_string()))?;
                (address, nsid)
            }
            None => (s, 1),
        };

        let mut parts = address.split(':');
        let bus = parts.next().ok_or_else(|| Error::InvalidBdf(s.to_string()))?;
        let rest = parts.next().ok_or_else(|| Error::InvalidBdf(s.to_string()))?;
        if parts.next().is_some() {
            return Err(Error::InvalidBdf(s.to_string()));
        }
        let (device, function) = rest
            .split_once('.')
            .ok_or_else(|| Error::InvalidBdf(s.to_string()))?;

        let bus = u8::from_str_radix(bus, 16).map_err(|_| Error::InvalidBdf(s.to_string()))?;
        let device =
            u8::from_str_radix(device, 16).map_err(|_| Error::InvalidBdf(s.to_string()))?;
        let function =
            u8::from_str_radix(function, 16).map_err(|_| Error::InvalidBdf(s.to_string()))?;

        Ok(Bdf {
            bus,
            device,
            function,
            nsid,
        })
    }

    /// The sysfs-style address, without the namespace suffix.
    pub fn address(&self) -> String {
        format!("{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address(), self.nsid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_address() {
        let bdf = Bdf::parse("01:00.0").unwrap();
        assert_eq!(bdf.bus, 0x01);
        assert_eq!(bdf.device, 0x00);
        assert_eq!(bdf.function, 0x0);
        assert_eq!(bdf.nsid, 1);
    }

    #[test]
    fn parses_address_with_namespace() {
        let bdf = Bdf::parse("ff:1f.7/3").unwrap();
        assert_eq!(bdf.bus, 0xff);
        assert_eq!(bdf.device, 0x1f);
        assert_eq!(bdf.function, 0x7);
        assert_eq!(bdf.nsid, 3);
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(Bdf::parse("not-a-bdf").is_err());
        assert!(Bdf::parse("01:00").is_err());
        assert!(Bdf::parse("01:00.0/not-a-number").is_err());
    }

    #[test]
    fn same_address_different_namespace_are_distinct_keys() {
        let a = Bdf::parse("01:00.0/1").unwrap();
        let b = Bdf::parse("01:00.0/2").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.address(), b.address());
    }
}
