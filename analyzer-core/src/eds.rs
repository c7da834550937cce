//! EDS (Electronic Data Sheet) resolver: builds `(index, subindex) -> name` and
//! `cob_id -> [(index, subindex, size_in_bits)]` maps from an INI-style object dictionary file.
//! Algorithm grounded on `original_source/canopen_analyzer/eds_parser.py`.

use std::collections::HashMap;
use std::sync::OnceLock;

use configparser::ini::Ini;
use log::{debug, info, warn};
use regex::Regex;

/// `(index, subindex)` object-dictionary address.
pub type OdAddress = (u16, u8);

type Sections = HashMap<String, HashMap<String, Option<String>>>;

fn object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:0x)?[0-9a-f]+$").unwrap())
}

fn sub_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:0x)?([0-9a-f]+)sub([0-9a-f]+)$").unwrap())
}

/// Immutable Object Dictionary metadata loaded from an EDS file (SPEC_FULL.md §4.1, §3).
#[derive(Debug, Clone, Default)]
pub struct EdsMap {
    name_map: HashMap<OdAddress, String>,
    pdo_map: HashMap<u16, Vec<(u16, u8, u8)>>,
}

impl EdsMap {
    /// The resolver with no EDS file loaded: both maps empty.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load and parse an EDS file. Never fails the caller: a malformed or missing file yields
    /// an empty map and a logged warning (SPEC_FULL.md §4.1 "Failure mode").
    pub fn load(path: &str) -> Self {
        match Self::try_load(path) {
            Ok(map) => map,
            Err(e) => {
                warn!("failed to parse EDS file '{path}': {e}");
                Self::default()
            }
        }
    }

    fn try_load(path: &str) -> Result<Self, String> {
        let mut ini = Ini::new();
        let sections = ini.load(path)?;
        let name_map = build_name_map(&sections);
        let pdo_map = build_pdo_map(&sections);
        let map = EdsMap { name_map, pdo_map };
        map.log_pdo_mapping_consistency();
        info!(
            "loaded EDS '{path}': {} named entries, {} PDO mappings",
            map.name_map.len(),
            map.pdo_map.len()
        );
        Ok(map)
    }

    /// Resolve `(index, sub)` to a parameter name, falling back to `(index, 0)` and finally to
    /// `None` if nothing is known about this address.
    pub fn resolve_name(&self, index: u16, sub: u8) -> Option<&str> {
        self.name_map
            .get(&(index, sub))
            .or_else(|| self.name_map.get(&(index, 0)))
            .map(String::as_str)
    }

    /// Resolve a name for presentation, falling back to `"0x{index:04X}:{sub}"` when unresolved
    /// (SPEC_FULL.md §7, "Unresolved OD address").
    pub fn resolve_name_or_fallback(&self, index: u16, sub: u8) -> String {
        self.resolve_name(index, sub)
            .map(str::to_string)
            .unwrap_or_else(|| format!("0x{index:04X}:{sub}"))
    }

    /// Mapping-entry list for a COB-ID, in declared order, or `None` if the COB-ID has no PDO
    /// mapping at all.
    pub fn pdo_entries(&self, cob_id: u16) -> Option<&[(u16, u8, u8)]> {
        self.pdo_map.get(&cob_id).map(Vec::as_slice)
    }

    fn log_pdo_mapping_consistency(&self) {
        for (cob_id, entries) in &self.pdo_map {
            for &(index, sub, _) in entries {
                if self.resolve_name(index, sub).is_none() {
                    warn!(
                        "PDO mapping for cob=0x{cob_id:03X} references 0x{index:04X}:{sub}, \
                         which has no entry in the EDS name map"
                    );
                }
            }
        }
    }
}

fn build_name_map(sections: &Sections) -> HashMap<OdAddress, String> {
    let mut parents: HashMap<u16, String> = HashMap::new();
    for (section, kv) in sections {
        let Some(caps) = object_re().captures(section) else {
            continue;
        };
        let Some(idx) = parse_hex_u16(&caps[0]) else {
            continue;
        };
        if let Some(name) = parameter_name(kv) {
            if !name.is_empty() {
                parents.insert(idx, name);
            }
        }
    }

    let mut name_map: HashMap<OdAddress, String> = HashMap::new();
    for (section, kv) in sections {
        let Some(caps) = sub_re().captures(section) else {
            continue;
        };
        let Some(idx) = parse_hex_u16(&caps[1]) else {
            continue;
        };
        let Some(sub) = parse_hex_u8(&caps[2]) else {
            continue;
        };
        let parent = parents
            .get(&idx)
            .cloned()
            .unwrap_or_else(|| format!("0x{idx:04X}"));
        let child = parameter_name(kv).unwrap_or_default();
        let resolved = if !child.is_empty() && !child.to_lowercase().contains("highest") {
            format!("{parent}.{child}")
        } else {
            parent
        };
        name_map.insert((idx, sub), resolved);
    }

    for (idx, parent) in &parents {
        name_map.entry((*idx, 0)).or_insert_with(|| parent.clone());
    }

    name_map
}

fn build_pdo_map(sections: &Sections) -> HashMap<u16, Vec<(u16, u8, u8)>> {
    let mut mapping_sections: Vec<&String> = sections
        .keys()
        .filter(|s| s.to_lowercase().starts_with("1a") && !s.to_lowercase().contains("sub"))
        .collect();
    mapping_sections.sort();

    let mut pdo_map = HashMap::new();
    for section in mapping_sections {
        let mut entries = Vec::new();
        let mut sub_idx = 1u32;
        loop {
            let key = format!("{section}sub{sub_idx}");
            let Some(kv) = sections.get(&key) else {
                break;
            };
            let Some(raw) = default_value(kv).and_then(|v| parse_default_value(&v)) else {
                break;
            };
            let index = ((raw >> 16) & 0xFFFF) as u16;
            let sub = ((raw >> 8) & 0xFF) as u8;
            let size = (raw & 0xFF) as u8;
            entries.push((index, sub, size));
            sub_idx += 1;
        }
        if entries.is_empty() {
            continue;
        }

        let comm_section = replace_leading_1a_with_18(section);
        let comm_sub1 = format!("{comm_section}sub1");
        let Some(cob_id) = sections
            .get(&comm_sub1)
            .and_then(default_value)
            .and_then(|v| parse_default_value(&v))
        else {
            debug!("PDO mapping section '{section}' has no companion COB-ID at '{comm_sub1}'");
            continue;
        };
        pdo_map.insert(cob_id as u16, entries);
    }
    pdo_map
}

fn replace_leading_1a_with_18(section: &str) -> String {
    let lower = section.to_lowercase();
    if let Some(rest) = lower.strip_prefix("1a") {
        format!("18{rest}")
    } else {
        lower
    }
}

fn parameter_name(kv: &HashMap<String, Option<String>>) -> Option<String> {
    kv.get("parametername")
        .and_then(|v| v.clone())
        .map(|s| s.trim().to_string())
}

fn default_value(kv: &HashMap<String, Option<String>>) -> Option<String> {
    kv.get("defaultvalue").and_then(|v| v.clone())
}

fn parse_default_value(raw: &str) -> Option<u32> {
    let cleaned = raw.split(';').next().unwrap_or("").trim();
    if cleaned.is_empty() {
        return None;
    }
    parse_int::parse::<u32>(cleaned).ok()
}

fn parse_hex_u16(s: &str) -> Option<u16> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(s, 16).ok()
}

fn parse_hex_u8(s: &str) -> Option<u8> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u8::from_str_radix(s, 16).ok()
}
