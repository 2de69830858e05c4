//! Literal marker detection in captured pane output.

/// First marker, in configured order, that appears verbatim in `output`.
/// Empty markers never match.
pub fn find_match<'a>(output: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .map(String::as_str)
        .filter(|marker| !marker.is_empty())
        .find(|marker| output.contains(marker))
}
