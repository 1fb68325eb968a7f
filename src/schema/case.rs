//! Identifier case conversion.
//!
//! The export spells tags in `snake_case` and discriminants / enum values as
//! free text ("hf abducted", "DEITY_CURSE_VAMPIRE_1"). Everything is folded
//! into one CamelCase form so matching never depends on the writer's casing.

/// `"hf abducted"` → `"HfAbducted"`, `"DEITY_CURSE"` → `"DeityCurse"`.
pub fn to_camel(s: &str) -> String {
    camel(s, true)
}

/// `"site_id"` → `"siteId"`, `"group_1_hfid"` → `"group1Hfid"`.
pub fn to_lower_camel(s: &str) -> String {
    camel(s, false)
}

fn camel(s: &str, init_upper: bool) -> String {
    let s = s.trim();
    let mut out = String::with_capacity(s.len());
    let mut cap_next = init_upper;
    let mut prev_is_cap = false;

    for (i, c) in s.chars().enumerate() {
        let is_cap = c.is_ascii_uppercase();
        let is_low = c.is_ascii_lowercase();
        let mut c = c;
        if cap_next {
            if is_low { c = c.to_ascii_uppercase(); }
        } else if i == 0 {
            if is_cap { c = c.to_ascii_lowercase(); }
        } else if prev_is_cap && is_cap {
            // runs of capitals collapse: "DEITY" → "Deity"
            c = c.to_ascii_lowercase();
        }
        prev_is_cap = is_cap;

        if is_cap || is_low {
            out.push(c);
            cap_next = false;
        } else if c.is_ascii_digit() {
            out.push(c);
            cap_next = true;
        } else {
            cap_next = matches!(c, '_' | ' ' | '-' | '.');
        }
    }
    out
}

/// `"HfAbducted"` → `"hf abducted"` (with `delim = ' '`).
pub fn to_delimited(s: &str, delim: char) -> String {
    let chars: Vec<char> = s.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.is_empty() && !out.ends_with(delim) {
                out.push(delim);
            }
            continue;
        }
        if i > 0 && !out.is_empty() && !out.ends_with(delim) && c.is_ascii_uppercase() {
            let prev = chars[i - 1];
            let next_low = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase() || prev.is_ascii_digit() || (prev.is_ascii_uppercase() && next_low) {
                out.push(delim);
            }
        }
        out.push(c.to_ascii_lowercase());
    }

    while out.ends_with(delim) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_from_free_text() {
        assert_eq!(to_camel("hf abducted"), "HfAbducted");
        assert_eq!(to_camel("add hf entity link"), "AddHfEntityLink");
        assert_eq!(to_camel("DEITY_CURSE_WEREBEAST"), "DeityCurseWerebeast");
        assert_eq!(to_camel("  beast attack "), "BeastAttack");
    }

    #[test]
    fn lower_camel_for_external_names() {
        assert_eq!(to_lower_camel("site_id"), "siteId");
        assert_eq!(to_lower_camel("group_1_hfid"), "group1Hfid");
        assert_eq!(to_lower_camel("id"), "id");
    }

    #[test]
    fn delimited_splits_on_case_boundaries() {
        assert_eq!(to_delimited("HfAbducted", ' '), "hf abducted");
        assert_eq!(to_delimited("DarkFortress", ' '), "dark fortress");
        assert_eq!(to_delimited("HTMLPage", ' '), "html page");
        assert_eq!(to_delimited("Tower_", ' '), "tower");
    }
}
