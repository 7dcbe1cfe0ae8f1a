//! Element allowlist and required-property rules.
//!
//! Checked before anything is sent to the backend so that a bad pipeline
//! description fails fast with every problem listed at once.

use std::fmt;
use streamctl_types::ElementDescriptor;
use thiserror::Error;

/// Functional role of an element in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementCategory {
    Source,
    Demux,
    Parse,
    Decode,
    Filter,
    Encode,
    Mux,
    Sink,
}

/// An element the backend is known to support.
#[derive(Debug, Clone, Copy)]
pub struct KnownElement {
    pub name: &'static str,
    pub category: ElementCategory,
    /// Properties that must be set to a non-empty value
    pub required: &'static [&'static str],
}

const fn known(
    name: &'static str,
    category: ElementCategory,
    required: &'static [&'static str],
) -> KnownElement {
    KnownElement {
        name,
        category,
        required,
    }
}

use ElementCategory::*;

const KNOWN_ELEMENTS: &[KnownElement] = &[
    // Sources
    known("videotestsrc", Source, &[]),
    known("audiotestsrc", Source, &[]),
    known("rtspsrc", Source, &["location"]),
    known("srtsrc", Source, &["uri"]),
    known("udpsrc", Source, &["port"]),
    known("filesrc", Source, &["location"]),
    known("souphttpsrc", Source, &["location"]),
    known("uridecodebin", Source, &["uri"]),
    // Demuxers
    known("tsdemux", Demux, &[]),
    known("qtdemux", Demux, &[]),
    known("matroskademux", Demux, &[]),
    known("flvdemux", Demux, &[]),
    // Parsers and depayloaders
    known("h264parse", Parse, &[]),
    known("h265parse", Parse, &[]),
    known("aacparse", Parse, &[]),
    known("rtph264depay", Parse, &[]),
    known("rtph265depay", Parse, &[]),
    // Decoders
    known("avdec_h264", Decode, &[]),
    known("avdec_h265", Decode, &[]),
    known("decodebin", Decode, &[]),
    // Filters
    known("queue", Filter, &[]),
    known("videoconvert", Filter, &[]),
    known("videoscale", Filter, &[]),
    known("videorate", Filter, &[]),
    known("audioconvert", Filter, &[]),
    known("audioresample", Filter, &[]),
    known("capsfilter", Filter, &[]),
    known("identity", Filter, &[]),
    // Encoders
    known("x264enc", Encode, &[]),
    known("x265enc", Encode, &[]),
    known("vp8enc", Encode, &[]),
    known("avenc_aac", Encode, &[]),
    // Muxers
    known("mpegtsmux", Mux, &[]),
    known("mp4mux", Mux, &[]),
    known("flvmux", Mux, &[]),
    known("matroskamux", Mux, &[]),
    // Sinks
    known("autovideosink", Sink, &[]),
    known("autoaudiosink", Sink, &[]),
    known("fakesink", Sink, &[]),
    known("appsink", Sink, &[]),
    known("filesink", Sink, &["location"]),
    known("srtsink", Sink, &["uri"]),
    known("rtmpsink", Sink, &["location"]),
    known("udpsink", Sink, &["host", "port"]),
];

/// Look up an element type in the allowlist.
pub fn lookup(element_type: &str) -> Option<&'static KnownElement> {
    KNOWN_ELEMENTS.iter().find(|e| e.name == element_type)
}

/// One problem found in a pipeline description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Empty,
    UnknownElement {
        index: usize,
        element_type: String,
    },
    MissingProperty {
        index: usize,
        element_type: String,
        property: &'static str,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Empty => write!(f, "pipeline has no elements"),
            Violation::UnknownElement {
                index,
                element_type,
            } => write!(f, "element {} ({}): unknown element type", index, element_type),
            Violation::MissingProperty {
                index,
                element_type,
                property,
            } => write!(
                f,
                "element {} ({}): missing required property '{}'",
                index, element_type, property
            ),
        }
    }
}

/// All violations found in a pipeline description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listed: Vec<String> = self.violations.iter().map(|v| v.to_string()).collect();
        write!(f, "Invalid pipeline: {}", listed.join("; "))
    }
}

/// Validate an element chain, collecting every violation.
pub fn validate(elements: &[ElementDescriptor]) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    if elements.is_empty() {
        violations.push(Violation::Empty);
    }

    for (index, element) in elements.iter().enumerate() {
        let Some(known) = lookup(&element.element_type) else {
            violations.push(Violation::UnknownElement {
                index,
                element_type: element.element_type.clone(),
            });
            continue;
        };

        for property in known.required {
            let present = element
                .properties
                .get(*property)
                .map(|v| v.is_present())
                .unwrap_or(false);
            if !present {
                violations.push(Violation::MissingProperty {
                    index,
                    element_type: element.element_type.clone(),
                    property,
                });
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}
