//! Class id → name lookup and the name → count bucket mapping.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;

pub const UNKNOWN_LABEL: &str = "N/A";

/// Count column a class contributes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountBucket {
    Cars,
    Trucks,
    People,
}

impl CountBucket {
    /// Default mapping: police cruisers and delivery vans count as trucks.
    pub fn default_mapping() -> BTreeMap<String, CountBucket> {
        [
            ("car", CountBucket::Cars),
            ("truck", CountBucket::Trucks),
            ("police", CountBucket::Trucks),
            ("ups", CountBucket::Trucks),
            ("pedestrian", CountBucket::People),
            ("person", CountBucket::People),
        ]
        .into_iter()
        .map(|(name, bucket)| (name.to_string(), bucket))
        .collect()
    }
}

/// Label map loaded from a TensorFlow object-detection `.pbtxt` file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMap {
    names: HashMap<u32, String>,
}

impl Default for LabelMap {
    /// Built-in six-class traffic map used when no label file is configured.
    fn default() -> Self {
        Self::from_pairs([
            (1, "car"),
            (2, "pedestrian"),
            (3, "truck"),
            (4, "police"),
            (5, "ups"),
            (6, "bicycle"),
        ])
    }
}

impl LabelMap {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (u32, &'a str)>) -> Self {
        Self {
            names: pairs
                .into_iter()
                .map(|(id, name)| (id, name.to_string()))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read label map {}", path.display()))?;
        Self::parse_pbtxt(&raw).with_context(|| format!("parse label map {}", path.display()))
    }

    /// Parse `item { id: N name: '...' display_name: '...' }` blocks.
    ///
    /// `display_name` wins over `name` when both are present.
    pub fn parse_pbtxt(raw: &str) -> Result<Self> {
        static ITEM_RE: OnceLock<regex::Regex> = OnceLock::new();
        static ID_RE: OnceLock<regex::Regex> = OnceLock::new();
        static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
        static DISPLAY_RE: OnceLock<regex::Regex> = OnceLock::new();
        let item_re = ITEM_RE.get_or_init(|| regex::Regex::new(r"item\s*\{([^}]*)\}").unwrap());
        let id_re = ID_RE.get_or_init(|| regex::Regex::new(r"\bid\s*:\s*(\d+)").unwrap());
        let name_re = NAME_RE
            .get_or_init(|| regex::Regex::new(r#"\bname\s*:\s*['"]([^'"]*)['"]"#).unwrap());
        let display_re = DISPLAY_RE.get_or_init(|| {
            regex::Regex::new(r#"\bdisplay_name\s*:\s*['"]([^'"]*)['"]"#).unwrap()
        });

        let mut names = HashMap::new();
        for item in item_re.captures_iter(raw) {
            let body = &item[1];
            let id: u32 = id_re
                .captures(body)
                .and_then(|c| c[1].parse().ok())
                .ok_or_else(|| anyhow!("label map item without numeric id"))?;
            let name = display_re
                .captures(body)
                .or_else(|| name_re.captures(body))
                .map(|c| c[1].to_string())
                .ok_or_else(|| anyhow!("label map item {} has no name", id))?;
            names.insert(id, name);
        }
        if names.is_empty() {
            return Err(anyhow!("label map contains no items"));
        }
        Ok(Self { names })
    }

    pub fn name(&self, class_id: u32) -> &str {
        self.names
            .get(&class_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABELS: &str = r#"
item {
  id: 1
  name: 'car'
}
item {
  id: 2
  name: "ped"
  display_name: "pedestrian"
}
"#;

    #[test]
    fn parses_pbtxt_items() {
        let map = LabelMap::parse_pbtxt(LABELS).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.name(1), "car");
        assert_eq!(map.name(2), "pedestrian");
        assert_eq!(map.name(99), UNKNOWN_LABEL);
    }

    #[test]
    fn empty_label_map_is_an_error() {
        assert!(LabelMap::parse_pbtxt("# nothing here").is_err());
    }

    #[test]
    fn bucket_names_deserialize_lowercase() {
        let parsed: BTreeMap<String, CountBucket> =
            serde_json::from_str(r#"{"bus": "trucks", "cyclist": "people"}"#).unwrap();
        assert_eq!(parsed["bus"], CountBucket::Trucks);
        assert_eq!(parsed["cyclist"], CountBucket::People);
    }
}
