//! GStreamer element descriptors as sent to the backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One processing element in a pipeline description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    /// GStreamer element type (e.g., "videotestsrc", "x264enc", "filesink")
    #[serde(rename = "type")]
    pub element_type: String,
    /// Optional instance name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Element properties as key-value pairs
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl ElementDescriptor {
    /// Create a descriptor with no properties.
    pub fn new(element_type: impl Into<String>) -> Self {
        Self {
            element_type: element_type.into(),
            name: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set a property, builder style.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set a property only when a value is present.
    pub fn with_optional_property<V: Into<PropertyValue>>(
        mut self,
        name: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        if let Some(value) = value {
            self.properties.insert(name.into(), value.into());
        }
        self
    }

    /// Render as a `gst-launch` fragment, e.g. `filesrc location=/tmp/a.mp4`.
    pub fn launch_fragment(&self) -> String {
        let mut fragment = self.element_type.clone();
        if let Some(ref name) = self.name {
            fragment.push_str(&format!(" name={}", name));
        }
        for (key, value) in &self.properties {
            fragment.push_str(&format!(" {}={}", key, value));
        }
        fragment
    }
}

/// Render a linear element chain the way the backend parses it.
pub fn launch_line(elements: &[ElementDescriptor]) -> String {
    elements
        .iter()
        .map(ElementDescriptor::launch_fragment)
        .collect::<Vec<_>>()
        .join(" ! ")
}

/// Property value that can be various types.
///
/// GStreamer properties can be strings, numbers, booleans, enums, etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl PropertyValue {
    /// Whether the value carries something usable (non-empty strings only).
    pub fn is_present(&self) -> bool {
        match self {
            PropertyValue::String(s) => !s.trim().is_empty(),
            _ => true,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::String(s) if s.contains(char::is_whitespace) => write!(f, "\"{}\"", s),
            PropertyValue::String(s) => write!(f, "{}", s),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::UInt(u) => write!(f, "{}", u),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<u64> for PropertyValue {
    fn from(u: u64) -> Self {
        PropertyValue::UInt(u)
    }
}

impl From<u16> for PropertyValue {
    fn from(u: u16) -> Self {
        PropertyValue::UInt(u64::from(u))
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}
