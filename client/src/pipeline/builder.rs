//! Element chains for stream definitions.
//!
//! Values the caller did not provide (a source URI, a destination path) are
//! left out so that validation reports them instead of a guess being sent.

use streamctl_types::{
    DestinationKind, ElementDescriptor, SourceKind, StreamDestination, StreamSource, StreamType,
};

/// Bitrate used when re-encoding, in kbit/s.
pub const TRANSCODE_BITRATE_KBPS: u64 = 2_000;

/// Format of the media at the end of a partial chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Media {
    Raw,
    H264,
}

/// Build the element chain for a stream.
pub fn build_elements(
    stream_type: StreamType,
    source: &StreamSource,
    destination: Option<&StreamDestination>,
) -> Vec<ElementDescriptor> {
    let (mut chain, media) = source_chain(source);

    match stream_type {
        StreamType::Live => match destination {
            None => {
                ensure_raw(&mut chain, media);
                chain.push(ElementDescriptor::new("autovideosink").with_property("sync", false));
            }
            Some(destination) => {
                ensure_encoded(&mut chain, media);
                chain.extend(destination_chain(destination));
            }
        },
        StreamType::Recording => {
            ensure_encoded(&mut chain, media);
            match destination {
                Some(d) if d.kind != DestinationKind::File => chain.extend(destination_chain(d)),
                _ => {
                    chain.push(ElementDescriptor::new("mp4mux"));
                    chain.push(
                        ElementDescriptor::new("filesink")
                            .with_optional_property("location", destination.and_then(|d| d.uri.clone())),
                    );
                }
            }
        }
        StreamType::Transcode => {
            ensure_raw(&mut chain, media);
            chain.push(
                ElementDescriptor::new("x264enc")
                    .with_property("bitrate", TRANSCODE_BITRATE_KBPS)
                    .with_property("tune", "zerolatency"),
            );
            chain.push(ElementDescriptor::new("h264parse"));
            chain.extend(destination_or_null(destination));
        }
        StreamType::Relay => {
            ensure_encoded(&mut chain, media);
            chain.extend(destination_or_null(destination));
        }
    }

    chain
}

fn source_chain(source: &StreamSource) -> (Vec<ElementDescriptor>, Media) {
    let uri = source.uri.clone();
    match source.kind {
        SourceKind::Test => (
            vec![ElementDescriptor::new("videotestsrc").with_property("is-live", true)],
            Media::Raw,
        ),
        SourceKind::Rtsp => (
            vec![
                ElementDescriptor::new("rtspsrc")
                    .with_optional_property("location", uri)
                    .with_property("latency", 200u64),
                ElementDescriptor::new("rtph264depay"),
                ElementDescriptor::new("h264parse"),
            ],
            Media::H264,
        ),
        SourceKind::Srt => (
            vec![
                ElementDescriptor::new("srtsrc").with_optional_property("uri", uri),
                ElementDescriptor::new("tsdemux"),
                ElementDescriptor::new("h264parse"),
            ],
            Media::H264,
        ),
        SourceKind::Udp => (
            vec![
                ElementDescriptor::new("udpsrc")
                    .with_optional_property("port", uri.as_deref().and_then(parse_port)),
                ElementDescriptor::new("tsdemux"),
                ElementDescriptor::new("h264parse"),
            ],
            Media::H264,
        ),
        SourceKind::File => (
            vec![
                ElementDescriptor::new("filesrc").with_optional_property("location", uri),
                ElementDescriptor::new("qtdemux"),
                ElementDescriptor::new("h264parse"),
            ],
            Media::H264,
        ),
        SourceKind::Http => (
            vec![
                ElementDescriptor::new("souphttpsrc").with_optional_property("location", uri),
                ElementDescriptor::new("tsdemux"),
                ElementDescriptor::new("h264parse"),
            ],
            Media::H264,
        ),
    }
}

fn destination_chain(destination: &StreamDestination) -> Vec<ElementDescriptor> {
    let uri = destination.uri.clone();
    match destination.kind {
        DestinationKind::File => vec![
            ElementDescriptor::new("mpegtsmux"),
            ElementDescriptor::new("filesink").with_optional_property("location", uri),
        ],
        DestinationKind::Srt => vec![
            ElementDescriptor::new("mpegtsmux"),
            ElementDescriptor::new("srtsink").with_optional_property("uri", uri),
        ],
        DestinationKind::Rtmp => vec![
            ElementDescriptor::new("flvmux").with_property("streamable", true),
            ElementDescriptor::new("rtmpsink").with_optional_property("location", uri),
        ],
        DestinationKind::Udp => {
            let (host, port) = match uri.as_deref().map(split_host_port) {
                Some((host, port)) => (host, port),
                None => (None, None),
            };
            vec![
                ElementDescriptor::new("mpegtsmux"),
                ElementDescriptor::new("udpsink")
                    .with_optional_property("host", host)
                    .with_optional_property("port", port),
            ]
        }
        DestinationKind::Null => {
            vec![ElementDescriptor::new("fakesink").with_property("sync", false)]
        }
    }
}

fn destination_or_null(destination: Option<&StreamDestination>) -> Vec<ElementDescriptor> {
    match destination {
        Some(destination) => destination_chain(destination),
        None => destination_chain(&StreamDestination::new(DestinationKind::Null, None)),
    }
}

fn ensure_raw(chain: &mut Vec<ElementDescriptor>, media: Media) {
    if media == Media::H264 {
        chain.push(ElementDescriptor::new("avdec_h264"));
    }
    chain.push(ElementDescriptor::new("videoconvert"));
}

fn ensure_encoded(chain: &mut Vec<ElementDescriptor>, media: Media) {
    if media == Media::Raw {
        chain.push(ElementDescriptor::new("videoconvert"));
        chain.push(ElementDescriptor::new("x264enc").with_property("tune", "zerolatency"));
        chain.push(ElementDescriptor::new("h264parse"));
    }
}

fn parse_port(value: &str) -> Option<u16> {
    let value = value.trim();
    let value = value.rsplit(':').next().unwrap_or(value);
    value.parse().ok()
}

/// Split `host:port` (optionally prefixed with `udp://`).
fn split_host_port(value: &str) -> (Option<String>, Option<u16>) {
    let value = value.trim().trim_start_matches("udp://");
    match value.rsplit_once(':') {
        Some((host, port)) => (
            Some(host.to_string()).filter(|h| !h.is_empty()),
            port.parse().ok(),
        ),
        None => (Some(value.to_string()).filter(|h| !h.is_empty()), None),
    }
}
