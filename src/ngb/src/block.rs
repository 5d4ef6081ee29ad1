//! Data block location inside a table segment
//!
//! Block layout after the `START_DATA` marker:
//! - Byte 0: Type id
//! - Bytes 1-4: Element count (u32 LE)
//! - Bytes 5+: Payload, `count * element_size` bytes
//!
//! Scanning resumes after each payload, so marker bytes that happen to occur
//! inside a payload are never mistaken for structure.

use byteorder::{ByteOrder, LittleEndian};
use memchr::memmem;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::{DecodeContext, Registry, Values};
use crate::string::StringEncoding;
use crate::{Error, Result, END_TABLE, START_DATA};

/// Type id + element count
pub const BLOCK_HEADER_SIZE: usize = 5;

/// What to do when a block names a type id the registry does not know
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTypePolicy {
    /// Fail the whole file with `UnsupportedDataType`
    #[default]
    Abort,
    /// Log and resume scanning right after the block header
    Skip,
}

/// One data block found in a table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataBlock<'a> {
    pub type_id: u8,
    pub element_count: u32,
    /// Absolute offset of the `START_DATA` marker
    pub offset: usize,
    /// Absolute offset of the first payload byte
    pub payload_offset: usize,
    pub payload: &'a [u8],
}

/// Scans table segments for data blocks
#[derive(Debug, Clone, Copy)]
pub struct BlockLocator<'r> {
    registry: &'r Registry,
    encoding: StringEncoding,
    unknown_types: UnknownTypePolicy,
    max_elements: u32,
}

impl<'r> BlockLocator<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            encoding: StringEncoding::Standard,
            unknown_types: UnknownTypePolicy::Abort,
            max_elements: u32::MAX,
        }
    }

    /// Encoding of string (`0x1F`) payloads
    pub fn encoding(mut self, encoding: StringEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn unknown_types(mut self, policy: UnknownTypePolicy) -> Self {
        self.unknown_types = policy;
        self
    }

    /// Largest element count accepted in one block header
    pub fn max_elements(mut self, max: u32) -> Self {
        self.max_elements = max;
        self
    }

    fn context(&self, offset: usize) -> DecodeContext {
        DecodeContext {
            encoding: self.encoding,
            offset,
        }
    }

    /// Find every data block in `table`, in encounter order.
    ///
    /// `base` is the absolute offset of `table[0]` within its stream.
    /// Stops at the first `END_TABLE` that is not inside a payload.
    pub fn locate<'a>(&self, table: &'a [u8], base: usize) -> Result<Vec<DataBlock<'a>>> {
        let start_finder = memmem::Finder::new(&START_DATA);
        let end_finder = memmem::Finder::new(&END_TABLE);

        let mut blocks = Vec::new();
        let mut cursor = 0;
        let mut table_end = end_finder.find(table);

        while let Some(hit) = start_finder.find(&table[cursor..]) {
            if table_end.is_some_and(|end| end < cursor) {
                table_end = end_finder.find(&table[cursor..]).map(|p| cursor + p);
            }

            let marker = cursor + hit;
            if table_end.is_some_and(|end| end < marker) {
                break;
            }

            let header = marker + START_DATA.len();
            let payload_start = header + BLOCK_HEADER_SIZE;
            if payload_start > table.len() {
                return Err(Error::corrupted_at(base + marker, "truncated data block header"));
            }

            let type_id = table[header];
            let element_count = LittleEndian::read_u32(&table[header + 1..payload_start]);

            let Some(handler) = self.registry.get(type_id) else {
                match self.unknown_types {
                    UnknownTypePolicy::Abort => {
                        return Err(Error::UnsupportedDataType {
                            type_id,
                            offset: base + header,
                        });
                    }
                    UnknownTypePolicy::Skip => {
                        warn!(
                            "Skipping block with unknown type id 0x{:02x} at 0x{:x}",
                            type_id,
                            base + header
                        );
                        cursor = payload_start;
                        continue;
                    }
                }
            };

            if element_count > self.max_elements {
                return Err(Error::ResourceLimit {
                    what: "elements per block",
                    limit: u64::from(self.max_elements),
                    actual: u64::from(element_count),
                });
            }

            let area = &table[payload_start..];
            let ctx = self.context(base + payload_start);
            let len = handler.payload_len(area, element_count, &ctx)?;
            if len > area.len() as u64 {
                return Err(Error::corrupted_at(
                    base + marker,
                    format!(
                        "{} {} elements need {} bytes, {} left in table",
                        element_count,
                        handler.name,
                        len,
                        area.len()
                    ),
                ));
            }

            let payload_end = payload_start + len as usize;
            blocks.push(DataBlock {
                type_id,
                element_count,
                offset: base + marker,
                payload_offset: base + payload_start,
                payload: &table[payload_start..payload_end],
            });
            cursor = payload_end;
        }

        if blocks.is_empty() {
            debug!("No data blocks in table at 0x{:x}", base);
        }

        Ok(blocks)
    }

    /// Decode one located block
    pub fn decode(&self, block: &DataBlock) -> Result<Values> {
        self.registry.decode(
            block.type_id,
            block.payload,
            block.element_count,
            &self.context(block.payload_offset),
        )
    }

    /// Locate and decode every block in `table`
    pub fn decode_all(&self, table: &[u8], base: usize) -> Result<Vec<Values>> {
        self.locate(table, base)?
            .iter()
            .map(|block| self.decode(block))
            .collect()
    }
}

/// Serialize one data block (marker, header, payload)
pub fn encode_block(type_id: u8, element_count: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(START_DATA.len() + BLOCK_HEADER_SIZE + payload.len());
    out.extend_from_slice(&START_DATA);
    out.push(type_id);
    out.extend_from_slice(&element_count.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TYPE_FLOAT32, TYPE_FLOAT64, TYPE_INT32, TYPE_STRING};

    fn f64_payload(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_locate_f64_block() {
        let registry = Registry::standard();
        let mut table = b"\x8d\x75head".to_vec();
        table.extend(encode_block(TYPE_FLOAT64, 3, &f64_payload(&[1.0, 2.0, 3.0])));

        let locator = BlockLocator::new(&registry);
        let blocks = locator.locate(&table, 0).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].type_id, TYPE_FLOAT64);
        assert_eq!(blocks[0].element_count, 3);
        assert_eq!(blocks[0].offset, 6);
        assert_eq!(blocks[0].payload.len(), 24);

        let values = locator.decode(&blocks[0]).unwrap();
        assert_eq!(values, Values::Float64(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_locate_multiple_blocks() {
        let registry = Registry::standard();
        let mut table = encode_block(TYPE_INT32, 2, &[1, 0, 0, 0, 2, 0, 0, 0]);
        table.extend_from_slice(b"gap");
        table.extend(encode_block(TYPE_FLOAT32, 1, &1.5f32.to_le_bytes()));

        let values = BlockLocator::new(&registry).decode_all(&table, 0).unwrap();
        assert_eq!(
            values,
            vec![Values::Int32(vec![1, 2]), Values::Float32(vec![1.5])]
        );
    }

    #[test]
    fn test_unknown_type_aborts() {
        let registry = Registry::standard();
        let mut table = b"xx".to_vec();
        table.extend(encode_block(0xff, 1, &[0; 8]));

        let err = BlockLocator::new(&registry).locate(&table, 0x100).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedDataType {
                type_id: 0xff,
                offset: 0x107
            }
        ));
    }

    #[test]
    fn test_unknown_type_skip_policy() {
        let registry = Registry::standard();
        let mut table = encode_block(0xff, 1, &[0; 8]);
        table.extend(encode_block(TYPE_FLOAT64, 1, &f64_payload(&[4.0])));

        let values = BlockLocator::new(&registry)
            .unknown_types(UnknownTypePolicy::Skip)
            .decode_all(&table, 0)
            .unwrap();
        assert_eq!(values, vec![Values::Float64(vec![4.0])]);
    }

    #[test]
    fn test_payload_overrun_is_corruption() {
        let registry = Registry::standard();
        // Claims 10 doubles, carries 2
        let table = encode_block(TYPE_FLOAT64, 10, &f64_payload(&[1.0, 2.0]));

        let err = BlockLocator::new(&registry).locate(&table, 0).unwrap_err();
        assert!(matches!(err, Error::Corrupted { offset: Some(0), .. }));
    }

    #[test]
    fn test_huge_count_is_corruption_not_overflow() {
        let registry = Registry::standard();
        let table = encode_block(TYPE_FLOAT64, u32::MAX, &[0; 16]);
        assert!(matches!(
            BlockLocator::new(&registry).locate(&table, 0),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        let registry = Registry::standard();
        let mut table = START_DATA.to_vec();
        table.extend_from_slice(&[TYPE_FLOAT64, 0x01]);

        let err = BlockLocator::new(&registry).locate(&table, 0).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_end_table_stops_scan() {
        let registry = Registry::standard();
        let mut table = encode_block(TYPE_FLOAT64, 1, &f64_payload(&[1.0]));
        table.extend_from_slice(&END_TABLE);
        table.extend(encode_block(0xff, 1, &[0; 8]));

        let blocks = BlockLocator::new(&registry).locate(&table, 0).unwrap();
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_markers_inside_payload_are_data() {
        let registry = Registry::standard();
        // Payload bytes that spell END_TABLE then START_DATA
        let mut payload = END_TABLE.to_vec();
        payload.extend_from_slice(&START_DATA);
        payload.extend_from_slice(&[0; 6]);
        assert_eq!(payload.len(), 16);

        let mut table = encode_block(TYPE_FLOAT64, 2, &payload);
        table.extend(encode_block(TYPE_FLOAT64, 1, &f64_payload(&[9.0])));

        let blocks = BlockLocator::new(&registry).locate(&table, 0).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].element_count, 1);
    }

    #[test]
    fn test_element_limit() {
        let registry = Registry::standard();
        let table = encode_block(TYPE_FLOAT64, 4, &f64_payload(&[0.0; 4]));

        let err = BlockLocator::new(&registry)
            .max_elements(3)
            .locate(&table, 0)
            .unwrap_err();
        assert!(matches!(err, Error::ResourceLimit { actual: 4, .. }));
    }

    #[test]
    fn test_string_block() {
        let registry = Registry::standard();
        let mut payload = crate::string::encode("alpha", StringEncoding::Standard).unwrap();
        payload.extend(crate::string::encode("beta", StringEncoding::Standard).unwrap());

        let mut table = encode_block(TYPE_STRING, 2, &payload);
        table.extend_from_slice(b"tail");

        let values = BlockLocator::new(&registry).decode_all(&table, 0).unwrap();
        assert_eq!(
            values,
            vec![Values::String(vec!["alpha".into(), "beta".into()])]
        );
    }

    #[test]
    fn test_no_blocks() {
        let registry = Registry::standard();
        assert!(BlockLocator::new(&registry)
            .locate(b"no markers here", 0)
            .unwrap()
            .is_empty());
    }
}
