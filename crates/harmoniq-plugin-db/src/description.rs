use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tag_tree::TagElement;

/// Tag used for a single description inside a descriptor tree.
pub const PLUGIN_TAG: &str = "PLUGIN";

/// Metadata describing one loadable plugin unit found inside a plugin file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDescription {
    pub name: String,
    pub descriptive_name: String,
    pub plugin_format_name: String,
    pub category: Option<String>,
    pub manufacturer_name: Option<String>,
    pub version: Option<String>,
    pub file_or_identifier: String,
    pub unique_id: u32,
    pub is_instrument: bool,
    pub num_input_channels: u32,
    pub num_output_channels: u32,
    pub has_shared_container: bool,
    pub last_file_mod_time: Option<DateTime<Utc>>,
    pub last_info_update_time: DateTime<Utc>,
}

impl PluginDescription {
    pub fn new(
        name: impl Into<String>,
        plugin_format_name: impl Into<String>,
        file_or_identifier: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            descriptive_name: name.clone(),
            name,
            plugin_format_name: plugin_format_name.into(),
            category: None,
            manufacturer_name: None,
            version: None,
            file_or_identifier: file_or_identifier.into(),
            unique_id: 0,
            is_instrument: false,
            num_input_channels: 0,
            num_output_channels: 2,
            has_shared_container: false,
            last_file_mod_time: None,
            last_info_update_time: Utc::now(),
        }
    }

    /// Key used by the registry to tell descriptions apart.
    pub fn identifier_string(&self) -> String {
        format!(
            "{}-{}-{}-{:08x}",
            self.plugin_format_name, self.name, self.file_or_identifier, self.unique_id
        )
    }

    pub fn is_duplicate_of(&self, other: &PluginDescription) -> bool {
        self.plugin_format_name == other.plugin_format_name
            && self.file_or_identifier == other.file_or_identifier
            && self.unique_id == other.unique_id
    }

    pub fn to_element(&self) -> TagElement {
        let mut element = TagElement::new(PLUGIN_TAG);
        element.set("name", &self.name);
        element.set("descriptive_name", &self.descriptive_name);
        element.set("format", &self.plugin_format_name);
        if let Some(category) = &self.category {
            element.set("category", category);
        }
        if let Some(manufacturer) = &self.manufacturer_name {
            element.set("manufacturer", manufacturer);
        }
        if let Some(version) = &self.version {
            element.set("version", version);
        }
        element.set("file", &self.file_or_identifier);
        element.set("uid", format!("{:x}", self.unique_id));
        element.set("is_instrument", self.is_instrument.to_string());
        element.set("num_inputs", self.num_input_channels.to_string());
        element.set("num_outputs", self.num_output_channels.to_string());
        element.set("is_shell", self.has_shared_container.to_string());
        if let Some(modified) = &self.last_file_mod_time {
            element.set("file_time", modified.to_rfc3339());
        }
        element.set("info_update_time", self.last_info_update_time.to_rfc3339());
        element
    }

    /// Rebuilds a description from a `PLUGIN` element.
    ///
    /// Returns `None` when the tag is wrong, a required attribute (`name`,
    /// `format`, `file`) is missing, or a present attribute cannot be parsed.
    pub fn from_element(element: &TagElement) -> Option<Self> {
        if element.tag != PLUGIN_TAG {
            return None;
        }
        let name = element.get("name")?.to_string();
        let plugin_format_name = element.get("format")?.to_string();
        let file_or_identifier = element.get("file")?.to_string();

        let unique_id = match element.get("uid") {
            Some(raw) => u32::from_str_radix(raw, 16).ok()?,
            None => 0,
        };
        let last_file_mod_time = match element.get("file_time") {
            Some(raw) => Some(parse_time(raw)?),
            None => None,
        };
        let last_info_update_time = match element.get("info_update_time") {
            Some(raw) => parse_time(raw)?,
            None => Utc::now(),
        };

        Some(Self {
            descriptive_name: element
                .get("descriptive_name")
                .map(str::to_string)
                .unwrap_or_else(|| name.clone()),
            name,
            plugin_format_name,
            category: element.get("category").map(str::to_string),
            manufacturer_name: element.get("manufacturer").map(str::to_string),
            version: element.get("version").map(str::to_string),
            file_or_identifier,
            unique_id,
            is_instrument: parse_or(element.get("is_instrument"), false)?,
            num_input_channels: parse_or(element.get("num_inputs"), 0)?,
            num_output_channels: parse_or(element.get("num_outputs"), 0)?,
            has_shared_container: parse_or(element.get("is_shell"), false)?,
            last_file_mod_time,
            last_info_update_time,
        })
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

fn parse_or<T: std::str::FromStr>(raw: Option<&str>, default: T) -> Option<T> {
    match raw {
        Some(value) => value.parse().ok(),
        None => Some(default),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn reverb() -> PluginDescription {
        let mut desc = PluginDescription::new("Reverb", "VST3", "/plugins/Reverb.vst3");
        desc.manufacturer_name = Some("Acme".into());
        desc.category = Some("Fx|Reverb".into());
        desc.unique_id = 0xdead_beef;
        desc.num_input_channels = 2;
        desc
    }

    #[test]
    fn element_keeps_all_fields() {
        let desc = reverb();
        let restored = PluginDescription::from_element(&desc.to_element()).unwrap();
        assert_eq!(restored, desc);
    }

    #[test]
    fn element_without_file_is_rejected() {
        let mut element = reverb().to_element();
        element.attributes.remove("file");
        assert!(PluginDescription::from_element(&element).is_none());
    }

    #[test]
    fn bad_channel_count_is_rejected() {
        let mut element = reverb().to_element();
        element.set("num_outputs", "lots");
        assert!(PluginDescription::from_element(&element).is_none());
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let mut element = reverb().to_element();
        element.tag = "PRESET".into();
        assert!(PluginDescription::from_element(&element).is_none());
    }

    #[test]
    fn duplicates_ignore_display_name() {
        let first = reverb();
        let mut second = reverb();
        second.name = "Reverb (renamed)".into();
        assert!(first.is_duplicate_of(&second));
        assert_ne!(first.identifier_string(), second.identifier_string());
    }
}
