//! Range Handler Module
//!
//! Parses client `Range` headers into open or bounded range requests, resolves
//! them against a known resource size, and builds/parses `Content-Range` values.
//!
//! Byte positions are inclusive everywhere: a range `start..=end` covers
//! `end - start + 1` bytes.

use crate::{ProxyError, Result};
use tracing::debug;

/// Client range request as parsed from the `Range` header.
///
/// `end` of `None` means open-ended: read to the end of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeRequest {
    /// Full-resource request, used when no `Range` header is present
    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    /// Request with an explicit inclusive upper bound
    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Request reading from `start` to the end of the resource
    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }

    /// Resolve against the resource's total size.
    ///
    /// An open end becomes `total - 1`; an end past the resource is clamped to
    /// `total - 1`. A start at or beyond `total` cannot be served.
    pub fn resolve(&self, total: u64) -> Result<ByteRange> {
        if self.start >= total {
            return Err(ProxyError::RangeNotSatisfiable { total });
        }

        let last = total - 1;
        let end = match self.end {
            Some(end) => end.min(last),
            None => last,
        };

        Ok(ByteRange {
            start: self.start,
            end,
        })
    }
}

/// Concrete inclusive byte range within a resource of known size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

// A resolved range always holds at least one byte
#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    /// Number of bytes in this range
    ///
    /// # Example
    /// ```
    /// # use media_range_proxy::range_handler::ByteRange;
    /// # let range = ByteRange { start: 0, end: 99 };
    /// # assert_eq!(range.len(), 100);
    /// ```
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether this range covers the whole resource of `total` bytes
    pub fn covers(&self, total: u64) -> bool {
        self.start == 0 && self.end + 1 == total
    }
}

/// Parse the value of a client `Range` header.
///
/// Accepts exactly `bytes=<start>-` and `bytes=<start>-<end>` with decimal
/// positions and `start <= end`. Suffix ranges, multiple ranges and any
/// trailing input are rejected. An absent header yields a full request.
pub fn parse_range_header(range_header: Option<&str>) -> Result<RangeRequest> {
    let range_header = match range_header {
        Some(value) => value.trim(),
        None => return Ok(RangeRequest::full()),
    };

    debug!("Parsing Range header: {}", range_header);

    let spec = range_header.strip_prefix("bytes=").ok_or_else(|| {
        ProxyError::MalformedRange("Range header must start with 'bytes='".to_string())
    })?;

    if spec.contains(',') {
        return Err(ProxyError::MalformedRange(
            "Multiple ranges are not supported".to_string(),
        ));
    }

    let (start_str, end_str) = spec.split_once('-').ok_or_else(|| {
        ProxyError::MalformedRange("Range specification must contain a dash".to_string())
    })?;

    let start = parse_position(start_str, "start")?;

    if end_str.is_empty() {
        return Ok(RangeRequest::open(start));
    }

    let end = parse_position(end_str, "end")?;
    if start > end {
        return Err(ProxyError::MalformedRange(format!(
            "Start position {} is greater than end position {}",
            start, end
        )));
    }

    Ok(RangeRequest::bounded(start, end))
}

fn parse_position(value: &str, which: &str) -> Result<u64> {
    if value.is_empty() {
        return Err(ProxyError::MalformedRange(format!(
            "Missing {} position",
            which
        )));
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyError::MalformedRange(format!(
            "Invalid {} position '{}'",
            which, value
        )));
    }
    value.parse::<u64>().map_err(|_| {
        ProxyError::MalformedRange(format!("{} position '{}' is out of range", which, value))
    })
}

/// Build the `Content-Range` value for a served range
pub fn build_content_range_header(range: &ByteRange, total: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end, total)
}

/// Build the `Content-Range` value sent with a 416 response
pub fn build_unsatisfied_content_range(total: u64) -> String {
    format!("bytes */{}", total)
}

/// Build the `Range` value sent upstream for `[lower, upper]` or `[lower, end)`
pub fn build_upstream_range_header(lower: u64, upper: Option<u64>) -> String {
    match upper {
        Some(upper) => format!("bytes={}-{}", lower, upper),
        None => format!("bytes={}-", lower),
    }
}

/// Parse an upstream `Content-Range` header.
///
/// Examples:
/// - "bytes 0-999/5000" -> Some((0, 999, Some(5000)))
/// - "bytes 0-999/*" -> Some((0, 999, None))
pub fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = header.trim().strip_prefix("bytes ")?;
    let (range_part, total_str) = rest.split_once('/')?;

    let total = if total_str == "*" {
        None
    } else {
        Some(total_str.parse::<u64>().ok()?)
    };

    let (start_str, end_str) = range_part.split_once('-')?;
    let start: u64 = start_str.parse().ok()?;
    let end: u64 = end_str.parse().ok()?;

    if start > end {
        return None;
    }
    if let Some(total) = total {
        if end >= total {
            return None;
        }
    }

    Some((start, end, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_absent_header_is_full_request() {
        assert_eq!(parse_range_header(None).unwrap(), RangeRequest::full());
    }

    #[test]
    fn test_parse_valid_range_header() {
        assert_eq!(
            parse_range_header(Some("bytes=0-499")).unwrap(),
            RangeRequest::bounded(0, 499)
        );
        assert_eq!(
            parse_range_header(Some("bytes=500-")).unwrap(),
            RangeRequest::open(500)
        );
        assert_eq!(
            parse_range_header(Some("bytes=0-0")).unwrap(),
            RangeRequest::bounded(0, 0)
        );
        assert_eq!(
            parse_range_header(Some("  bytes=7-9 ")).unwrap(),
            RangeRequest::bounded(7, 9)
        );
    }

    #[test]
    fn test_parse_invalid_range_header() {
        let invalid = [
            "",
            "invalid",
            "bytes=",
            "bytes=-",
            "bytes=-200",
            "bytes=500-100",
            "bytes=abc-",
            "bytes=1-2x",
            "bytes=+1-2",
            "bytes=0-1,5-9",
            "bytes=1-2-3",
            "items=0-1",
            "bytes=99999999999999999999999-",
        ];
        for header in invalid {
            match parse_range_header(Some(header)) {
                Err(ProxyError::MalformedRange(_)) => {}
                other => panic!("Expected MalformedRange for {:?}, got {:?}", header, other),
            }
        }
    }

    #[test]
    fn test_resolve_open_end() {
        let range = RangeRequest::open(500).resolve(1000).unwrap();
        assert_eq!(range, ByteRange { start: 500, end: 999 });
        assert_eq!(range.len(), 500);
    }

    #[test]
    fn test_resolve_clamps_end() {
        let range = RangeRequest::bounded(10, 5000).resolve(1000).unwrap();
        assert_eq!(range.end, 999);
    }

    #[test]
    fn test_resolve_start_past_end() {
        assert_eq!(
            RangeRequest::open(1000).resolve(1000),
            Err(ProxyError::RangeNotSatisfiable { total: 1000 })
        );
        assert!(RangeRequest::full().resolve(0).is_err());
    }

    #[test]
    fn test_resolved_range_holds_at_least_one_byte() {
        assert_eq!(RangeRequest::full().resolve(1).unwrap().len(), 1);
        assert_eq!(RangeRequest::open(999).resolve(1000).unwrap().len(), 1);
        assert_eq!(RangeRequest::bounded(0, 0).resolve(1000).unwrap().len(), 1);
    }

    #[test]
    fn test_content_range_building() {
        let range = ByteRange { start: 0, end: 0 };
        assert_eq!(build_content_range_header(&range, 1000), "bytes 0-0/1000");
        assert_eq!(range.len(), 1);
        assert_eq!(build_unsatisfied_content_range(1000), "bytes */1000");
        assert!(ByteRange { start: 0, end: 999 }.covers(1000));
        assert!(!ByteRange { start: 1, end: 999 }.covers(1000));
    }

    #[test]
    fn test_upstream_range_header() {
        assert_eq!(build_upstream_range_header(0, None), "bytes=0-");
        assert_eq!(build_upstream_range_header(5, Some(9)), "bytes=5-9");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-999/5000"),
            Some((0, 999, Some(5000)))
        );
        assert_eq!(parse_content_range("bytes 0-999/*"), Some((0, 999, None)));
        assert_eq!(parse_content_range("bytes 10-5/100"), None);
        assert_eq!(parse_content_range("bytes 0-100/100"), None);
        assert_eq!(parse_content_range("0-99/100"), None);
    }
}
