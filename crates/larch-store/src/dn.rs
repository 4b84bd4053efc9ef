//! Distinguished names.
//!
//! DNs are parsed into a leaf-first list of RDNs and normalized on the way
//! in (attribute types and values lowercased, whitespace trimmed), so
//! equality and hashing are case-insensitive the way directory naming is.
//! Escaping of separator characters is not supported; the replication core
//! never produces values containing `,` or `+`.

use crate::error::StoreError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A relative distinguished name: one or more attribute-value assertions.
///
/// Multi-valued RDNs (`uid=x+cn=y`) arise when the conflict engine prepends
/// a disambiguating `entryuuid` value to an existing RDN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rdn {
    avas: Vec<(String, String)>,
}

impl Rdn {
    /// Build a single-valued RDN from an attribute type and value.
    pub fn new(attr: &str, value: &str) -> Self {
        Self {
            avas: vec![(normalize(attr), normalize(value))],
        }
    }

    /// Parse an RDN string such as `uid=alice` or `entryuuid=...+uid=alice`.
    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let mut avas = Vec::new();
        for part in input.split('+') {
            let (attr, value) = part.split_once('=').ok_or_else(|| StoreError::InvalidDn {
                input: input.to_string(),
            })?;
            let attr = normalize(attr);
            let value = normalize(value);
            if attr.is_empty() || value.is_empty() {
                return Err(StoreError::InvalidDn {
                    input: input.to_string(),
                });
            }
            avas.push((attr, value));
        }
        if avas.is_empty() {
            return Err(StoreError::InvalidDn {
                input: input.to_string(),
            });
        }
        Ok(Self { avas })
    }

    /// The attribute-value assertions, in order.
    pub fn avas(&self) -> &[(String, String)] {
        &self.avas
    }

    /// Returns true if the RDN names the given attribute with the given
    /// value (case-insensitive).
    pub fn contains(&self, attr: &str, value: &str) -> bool {
        let attr = normalize(attr);
        let value = normalize(value);
        self.avas.iter().any(|(a, v)| *a == attr && *v == value)
    }

    /// Returns true if any assertion in the RDN uses the given attribute.
    pub fn uses_attr(&self, attr: &str) -> bool {
        let attr = normalize(attr);
        self.avas.iter().any(|(a, _)| *a == attr)
    }

    /// A new RDN with the given assertion prepended (used for conflict
    /// disambiguation).
    pub fn prepend(&self, attr: &str, value: &str) -> Self {
        let mut avas = vec![(normalize(attr), normalize(value))];
        avas.extend(self.avas.iter().cloned());
        Self { avas }
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (attr, value)) in self.avas.iter().enumerate() {
            if i > 0 {
                write!(f, "+")?;
            }
            write!(f, "{}={}", attr, value)?;
        }
        Ok(())
    }
}

impl FromStr for Rdn {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Rdn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Rdn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

/// A distinguished name: a leaf-first sequence of RDNs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// Parse a DN string such as `uid=alice,ou=people,dc=example,dc=com`.
    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(StoreError::InvalidDn {
                input: input.to_string(),
            });
        }
        let rdns = input
            .split(',')
            .map(Rdn::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rdns })
    }

    /// The leaf RDN.
    pub fn rdn(&self) -> &Rdn {
        &self.rdns[0]
    }

    /// The parent DN, or `None` for a single-RDN name.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.len() <= 1 {
            return None;
        }
        Some(Dn {
            rdns: self.rdns[1..].to_vec(),
        })
    }

    /// A child of this DN with the given leaf RDN.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = vec![rdn];
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// This DN with its leaf RDN replaced.
    pub fn with_rdn(&self, rdn: Rdn) -> Dn {
        let mut rdns = self.rdns.clone();
        rdns[0] = rdn;
        Dn { rdns }
    }

    /// Number of RDN components.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Returns true if `self` is a strict descendant of `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        let n = ancestor.rdns.len();
        self.rdns.len() > n && self.rdns[self.rdns.len() - n..] == ancestor.rdns[..]
    }

    /// Rewrite this DN so the `old_parent` prefix is replaced by
    /// `new_parent`. Returns `None` when the DN is not under `old_parent`.
    pub fn rebase(&self, old_parent: &Dn, new_parent: &Dn) -> Option<Dn> {
        if !self.is_descendant_of(old_parent) {
            return None;
        }
        let keep = self.rdns.len() - old_parent.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend(new_parent.rdns.iter().cloned());
        Some(Dn { rdns })
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl FromStr for Dn {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Dn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Dn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}
