//! Object key derivation.
//!
//! Keys are opaque to callers and derived deterministically from an
//! artifact coordinate. The encoding here is an adapter concern and not
//! part of the public contract.

use depot_core::ArtifactCoordinate;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

/// Characters escaped inside a key component. Everything that could be
/// misread as key structure or break a URL is encoded.
const COMPONENT_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'\\')
    .add(b'?')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+');

/// Prefix under which all artifact objects live.
const ARTIFACT_ROOT: &str = "artifacts";

/// Derive the object key for a coordinate.
pub fn object_key(coordinate: &ArtifactCoordinate) -> String {
    format!(
        "{ARTIFACT_ROOT}/{}/{}/{}/{}",
        encode(&coordinate.app),
        encode(&coordinate.version),
        encode(&coordinate.platform),
        encode(&coordinate.filename),
    )
}

/// Derive the listing prefix for a raw caller-supplied prefix string.
///
/// An empty prefix lists every artifact; anything else is scoped under
/// the artifact root.
pub fn listing_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        format!("{ARTIFACT_ROOT}/")
    } else {
        format!("{ARTIFACT_ROOT}/{}", prefix.trim_start_matches('/'))
    }
}

fn encode(component: &str) -> String {
    utf8_percent_encode(component, COMPONENT_ESCAPE).to_string()
}
