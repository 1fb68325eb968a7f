//! Enum registry: stable ordinals for enumerated string fields.
//!
//! Raw values are collected offline from a broad sample of exports and listed
//! in the schema. Each domain canonicalizes them into identifiers, dedups and
//! sorts, so ordinals depend only on the set of observed strings.
use std::collections::BTreeMap;
use indexmap::IndexMap;

use super::case;

/// Ordinal reserved for values outside the observed set.
pub const UNKNOWN: u32 = 0;
const UNKNOWN_DISPLAY: &str = "unknown";

/// Identifier form of a raw export string.
///
/// `"2"` is spelled out so identifiers never start with a digit, `":"` acts
/// as a word break.
pub fn canonical(raw: &str) -> String {
    case::to_camel(&raw.replace('2', " two").replace(':', "_"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDomain {
    pub name: String,
    /// Canonical identifiers; ordinal = index + 1.
    variants: Vec<String>,
    displays: Vec<String>,
    by_raw: BTreeMap<String, u32>,
    by_canonical: BTreeMap<String, u32>,
}

impl EnumDomain {
    pub fn from_observed<I, S>(name: &str, observed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let raws: Vec<String> = observed.into_iter().map(|s| s.as_ref().to_string()).collect();

        let mut variants: Vec<String> = raws
            .iter()
            .map(|r| canonical(r))
            .filter(|c| !c.is_empty())
            .collect();
        variants.sort_unstable();
        variants.dedup();

        let by_canonical: BTreeMap<String, u32> = variants
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u32 + 1))
            .collect();
        let by_raw = raws
            .iter()
            .filter_map(|r| by_canonical.get(&canonical(r)).map(|&o| (r.clone(), o)))
            .collect();
        let displays = variants.iter().map(|v| case::to_delimited(v, ' ')).collect();

        Self { name: name.to_string(), variants, displays, by_raw, by_canonical }
    }

    /// Never fails: anything unrecognized is [`UNKNOWN`].
    pub fn decode(&self, raw: &str) -> u32 {
        if let Some(&o) = self.by_raw.get(raw) {
            return o;
        }
        self.by_canonical.get(&canonical(raw)).copied().unwrap_or(UNKNOWN)
    }

    pub fn display(&self, ordinal: u32) -> &str {
        match ordinal.checked_sub(1) {
            Some(i) => self.displays.get(i as usize).map(String::as_str).unwrap_or(UNKNOWN_DISPLAY),
            None => UNKNOWN_DISPLAY,
        }
    }

    pub fn variant(&self, ordinal: u32) -> Option<&str> {
        let i = ordinal.checked_sub(1)?;
        self.variants.get(i as usize).map(String::as_str)
    }

    /// Inverse of [`EnumDomain::display`], for reading the external shape back.
    pub fn from_display(&self, display: &str) -> u32 {
        self.displays
            .iter()
            .position(|d| d == display)
            .map(|i| i as u32 + 1)
            .unwrap_or(UNKNOWN)
    }

    /// Number of known variants (excluding unknown).
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumRegistry {
    domains: IndexMap<String, EnumDomain>,
}

impl EnumRegistry {
    pub fn build(decl: &IndexMap<String, Vec<String>>) -> Self {
        let domains = decl
            .iter()
            .map(|(name, raws)| (name.clone(), EnumDomain::from_observed(name, raws)))
            .collect();
        Self { domains }
    }

    pub fn get(&self, domain: &str) -> Option<&EnumDomain> {
        self.domains.get(domain)
    }

    /// Unknown domains decode everything to [`UNKNOWN`].
    pub fn decode(&self, domain: &str, raw: &str) -> u32 {
        self.get(domain).map(|d| d.decode(raw)).unwrap_or(UNKNOWN)
    }

    pub fn display(&self, domain: &str, ordinal: u32) -> &str {
        self.get(domain).map(|d| d.display(ordinal)).unwrap_or(UNKNOWN_DISPLAY)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnumDomain> {
        self.domains.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_types() -> EnumDomain {
        EnumDomain::from_observed("SiteType", ["dark fortress", "cave", "Cave", "tower", "mountain halls"])
    }

    #[test]
    fn ordinals_are_sorted_deduped_and_skip_zero() {
        let d = site_types();
        assert_eq!(d.len(), 4);
        assert_eq!(d.variant(1), Some("Cave"));
        assert_eq!(d.variant(2), Some("DarkFortress"));
        assert_eq!(d.decode("cave"), d.decode("Cave"));
        assert_ne!(d.decode("cave"), UNKNOWN);
    }

    #[test]
    fn unrecognized_values_decode_to_unknown() {
        let d = site_types();
        assert_eq!(d.decode("castle"), UNKNOWN);
        assert_eq!(d.decode(""), UNKNOWN);
        assert_eq!(d.display(UNKNOWN), "unknown");
        assert_eq!(d.display(99), "unknown");
    }

    #[test]
    fn display_round_trips_through_ordinal() {
        let d = site_types();
        let o = d.decode("mountain halls");
        assert_eq!(d.display(o), "mountain halls");
        assert_eq!(d.from_display("mountain halls"), o);
    }

    #[test]
    fn digits_and_colons_are_canonicalized() {
        assert_eq!(canonical("hf 2 handed"), "HfTwoHanded");
        assert_eq!(canonical("material:stone"), "MaterialStone");
    }

    #[test]
    fn ordinals_do_not_depend_on_observation_order() {
        let a = EnumDomain::from_observed("X", ["b", "a", "c"]);
        let b = EnumDomain::from_observed("X", ["c", "b", "a", "a"]);
        assert_eq!(a.variant(1), b.variant(1));
        assert_eq!(a.decode("c"), b.decode("c"));
    }
}
