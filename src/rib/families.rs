use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt;

use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

use crate::message::{Afi, Safi};

/// One (AFI, SAFI) pair
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Family {
    pub afi: Afi,
    pub safi: Safi,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.afi, self.safi)
    }
}

impl Family {
    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self { afi, safi }
    }
}

impl From<Family> for (Afi, Safi) {
    fn from(family: Family) -> (Afi, Safi) {
        (family.afi, family.safi)
    }
}

impl From<(Afi, Safi)> for Family {
    fn from(pair: (Afi, Safi)) -> Family {
        Family::new(pair.0, pair.1)
    }
}

impl TryFrom<(u16, u8)> for Family {
    type Error = std::io::Error;

    fn try_from(v: (u16, u8)) -> Result<Self, Self::Error> {
        Ok(Self::new(Afi::try_from(v.0)?, Safi::try_from(v.1)?))
    }
}

impl Serialize for Family {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Family {
    fn deserialize<D>(deserializer: D) -> Result<Family, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let parts: Vec<&str> = s.trim().split_whitespace().collect();
        if parts.len() != 2 {
            return Err(serde::de::Error::custom(format!(
                "Incorrect family format: '{}'",
                s
            )));
        }
        let afi = match parts[0] {
            "ipv4" => Afi::Ipv4,
            "ipv6" => Afi::Ipv6,
            "l2vpn" => Afi::L2vpn,
            family => {
                return Err(serde::de::Error::custom(format!(
                    "Unsupported AFI: '{}'",
                    family
                )))
            }
        };
        let safi = match parts[1] {
            "unicast" => Safi::Unicast,
            "multicast" => Safi::Multicast,
            "nlri-mpls" => Safi::Mpls,
            "mpls-vpn" => Safi::MplsVpn,
            "vpls" => Safi::Vpls,
            "evpn" => Safi::Evpn,
            "flow" => Safi::Flow,
            "flow-vpn" => Safi::FlowVpn,
            sfamily => {
                return Err(serde::de::Error::custom(format!(
                    "Unsupported SAFI: '{}'",
                    sfamily
                )))
            }
        };
        Ok(Family::new(afi, safi))
    }
}

/// The set of families a peer is configured or negotiated for
#[derive(Debug, Clone, Default)]
pub struct Families(HashSet<Family>);

impl Families {
    pub fn new(families: Vec<Family>) -> Self {
        Self(families.into_iter().collect())
    }

    pub fn common(&self, other: &Families) -> Self {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn contains(&self, family: Family) -> bool {
        self.0.contains(&family)
    }

    pub fn iter(&self) -> std::collections::hash_set::Iter<Family> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorted for deterministic capability emission
    pub fn to_pairs(&self) -> Vec<(Afi, Safi)> {
        let mut pairs: Vec<(Afi, Safi)> = self.0.iter().map(|f| (f.afi, f.safi)).collect();
        pairs.sort_by_key(|(afi, safi)| (*afi as u16, *safi as u8));
        pairs
    }
}

impl From<&[(Afi, Safi)]> for Families {
    fn from(pairs: &[(Afi, Safi)]) -> Self {
        Self(pairs.iter().map(|p| Family::from(*p)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::value::{Error, StrDeserializer};
    use serde::de::IntoDeserializer;

    #[test]
    fn test_serialize_family() {
        assert_eq!(
            &Family::new(Afi::Ipv4, Safi::Unicast).to_string(),
            "IPv4 Unicast"
        );
        assert_eq!(&Family::new(Afi::Ipv6, Safi::Flow).to_string(), "IPv6 Flow");
    }

    #[test]
    fn test_deserialize_family() {
        let deserializer: StrDeserializer<Error> = "ipv6 unicast".into_deserializer();
        let family = Family::deserialize(deserializer).unwrap();
        assert_eq!(family, Family::new(Afi::Ipv6, Safi::Unicast));

        let deserializer: StrDeserializer<Error> = "ipv4 flow".into_deserializer();
        let family = Family::deserialize(deserializer).unwrap();
        assert_eq!(family, Family::new(Afi::Ipv4, Safi::Flow));

        let deserializer: StrDeserializer<Error> = "l2vpn vpls".into_deserializer();
        let family = Family::deserialize(deserializer).unwrap();
        assert_eq!(family, Family::new(Afi::L2vpn, Safi::Vpls));
    }

    #[test]
    fn test_families_common() {
        let a = Families::new(vec![
            Family::new(Afi::Ipv4, Safi::Unicast),
            Family::new(Afi::Ipv6, Safi::Unicast),
        ]);
        let b = Families::new(vec![Family::new(Afi::Ipv4, Safi::Unicast)]);
        let common = a.common(&b);
        assert_eq!(common.len(), 1);
        assert!(common.contains(Family::new(Afi::Ipv4, Safi::Unicast)));
    }
}
