use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::description::PluginDescription;

/// Root tag of a descriptor tree exchanged by scan workers.
pub const PLUGINS_TAG: &str = "PLUGINS";

/// Node of the nested tag/attribute tree used to serialize descriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagElement {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub children: Vec<TagElement>,
}

impl TagElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }
}

pub fn descriptions_to_text(descriptions: &[PluginDescription]) -> String {
    let mut root = TagElement::new(PLUGINS_TAG);
    root.children = descriptions.iter().map(PluginDescription::to_element).collect();
    // A tree of strings always serializes.
    serde_json::to_string(&root).unwrap_or_default()
}

/// Parses a descriptor tree, skipping any child that is not a valid
/// description. Empty or unparsable text yields no descriptions.
pub fn descriptions_from_text(text: &str) -> Vec<PluginDescription> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let root: Value = match serde_json::from_str(text) {
        Ok(root) => root,
        Err(err) => {
            log::debug!("discarding unparsable descriptor tree: {err}");
            return Vec::new();
        }
    };
    let Some(children) = root.get("children").and_then(Value::as_array) else {
        return Vec::new();
    };

    children
        .iter()
        .filter_map(|child| {
            let element = serde_json::from_value::<TagElement>(child.clone()).ok();
            let description = element.as_ref().and_then(PluginDescription::from_element);
            if description.is_none() {
                log::debug!("skipping malformed descriptor entry: {child}");
            }
            description
        })
        .collect()
}
