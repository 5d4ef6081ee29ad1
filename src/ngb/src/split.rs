//! Stream splitting into table segments
//!
//! Segments are borrowed views into the stream buffer; nothing is copied.

use memchr::memmem;

use crate::{Error, Result};

/// Iterate the non-empty segments between occurrences of `separator`
fn segments<'a>(data: &'a [u8], separator: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut start = 0;
    memmem::find_iter(data, separator)
        .map(Some)
        .chain(std::iter::once(None))
        .filter_map(move |hit| {
            let end = hit.unwrap_or(data.len());
            let segment = &data[start..end];
            start = end + separator.len();
            (!segment.is_empty()).then_some(segment)
        })
}

/// Split a stream on every occurrence of `separator`.
///
/// Empty segments (leading, trailing or consecutive separators) are dropped.
/// A buffer with no separator, including one shorter than the separator,
/// comes back whole as a single segment.
pub fn split_tables<'a>(data: &'a [u8], separator: &'a [u8]) -> Vec<&'a [u8]> {
    if separator.is_empty() || memmem::find(data, separator).is_none() {
        return vec![data];
    }
    segments(data, separator).collect()
}

/// [`split_tables`] with a cap on the number of segments.
///
/// Past the cap the remaining segments are only counted, so the error
/// reports the real total.
pub fn split_tables_limited<'a>(
    data: &'a [u8],
    separator: &'a [u8],
    max_tables: usize,
) -> Result<Vec<&'a [u8]>> {
    if separator.is_empty() || memmem::find(data, separator).is_none() {
        return Ok(vec![data]);
    }

    let mut tables = Vec::new();
    let mut rest = segments(data, separator);
    while let Some(segment) = rest.next() {
        if tables.len() == max_tables {
            let actual = tables.len() + 1 + rest.count();
            return Err(Error::ResourceLimit {
                what: "tables per stream",
                limit: max_tables as u64,
                actual: actual as u64,
            });
        }
        tables.push(segment);
    }
    Ok(tables)
}
