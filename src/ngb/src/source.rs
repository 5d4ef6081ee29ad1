//! Stream buffers handed over by the archive reader
//!
//! Opening the NGB package is the caller's job. Decoding only needs a way to
//! look up fully materialized stream buffers by name.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

/// Named stream buffers of one file
pub trait StreamSource {
    /// Buffer of the named stream, `None` if the file has no such stream
    fn stream(&self, name: &str) -> Option<&[u8]>;
}

impl<K, V, S> StreamSource for HashMap<K, V, S>
where
    K: Borrow<str> + Eq + Hash,
    V: AsRef<[u8]>,
    S: BuildHasher,
{
    fn stream(&self, name: &str) -> Option<&[u8]> {
        self.get(name).map(AsRef::as_ref)
    }
}

impl<K, V> StreamSource for BTreeMap<K, V>
where
    K: Borrow<str> + Ord,
    V: AsRef<[u8]>,
{
    fn stream(&self, name: &str) -> Option<&[u8]> {
        self.get(name).map(AsRef::as_ref)
    }
}

impl<T: StreamSource + ?Sized> StreamSource for &T {
    fn stream(&self, name: &str) -> Option<&[u8]> {
        (**self).stream(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_map_source() {
        let mut streams: HashMap<String, Vec<u8>> = HashMap::new();
        streams.insert("Streams/stream_1.table".into(), vec![1, 2, 3]);

        assert_eq!(streams.stream("Streams/stream_1.table"), Some(&[1u8, 2, 3][..]));
        assert_eq!(streams.stream("Streams/stream_2.table"), None);
    }

    #[test]
    fn test_borrowed_btree_source() {
        let data = [9u8; 4];
        let mut streams: BTreeMap<&str, &[u8]> = BTreeMap::new();
        streams.insert("a", &data);

        let source: &dyn StreamSource = &streams;
        assert_eq!(source.stream("a"), Some(&data[..]));
    }
}
