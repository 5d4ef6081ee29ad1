//! One-file decode orchestration

use tracing::debug;

use crate::assemble::{ParsedTable, SegmentOutput, TableAssembler};
use crate::block::BlockLocator;
use crate::config::{ParserConfig, StreamSpec};
use crate::hash::{content_hash, file_hash_value};
use crate::metadata::FileMetadata;
use crate::pattern::PatternMatcher;
use crate::registry::{ColumnKey, DecodedArray, Registry};
use crate::source::StreamSource;
use crate::split::split_tables_limited;
use crate::{Error, Result, TABLE_SEPARATOR};

/// A stream that is present in the file being decoded
struct Present<'s, 'c> {
    index: usize,
    spec: &'c StreamSpec,
    data: &'s [u8],
}

/// Immutable NGB decoder.
///
/// Holds a validated configuration and a type registry. Neither changes after
/// construction, so one parser can decode many files from many threads.
#[derive(Debug, Clone)]
pub struct Parser {
    config: ParserConfig,
    registry: Registry,
}

impl Parser {
    /// Parser with the standard type registry
    pub fn new(config: ParserConfig) -> Result<Self> {
        Self::with_registry(config, Registry::standard())
    }

    /// Parser with a custom registry (e.g. extra type ids)
    pub fn with_registry(mut config: ParserConfig, registry: Registry) -> Result<Self> {
        config.validate()?;
        config.columns = config.columns.normalized()?;
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Decode one file.
    ///
    /// Fails on the first unrecoverable condition; there is no partial result.
    pub fn parse<S: StreamSource + ?Sized>(&self, source: &S) -> Result<ParsedTable> {
        let present = self.present_streams(source)?;
        self.check_size(&present)?;
        self.check_version(&present)?;

        let config = &self.config;
        let matcher = self.matcher();
        let locator = BlockLocator::new(&self.registry)
            .encoding(config.string_encoding)
            .unknown_types(config.unknown_types)
            .max_elements(config.limits.max_elements_per_block);

        let mut assembler = TableAssembler::new(&config.columns);
        let mut position = 0;

        for stream in &present {
            let tables = split_tables_limited(
                stream.data,
                &TABLE_SEPARATOR,
                config.limits.max_tables_per_stream,
            )?;
            debug!("{}: {} tables", stream.spec.name, tables.len());

            // A header names the column of its own and later header-less tables
            let mut current: Option<String> = None;

            for table in tables {
                let base = table.as_ptr() as usize - stream.data.as_ptr() as usize;

                let (metadata, fallback) = if stream.spec.metadata {
                    (matcher.extract(table), matcher.extract_fallbacks(table))
                } else {
                    (FileMetadata::new(), FileMetadata::new())
                };

                let mut arrays = Vec::new();
                if stream.spec.blocks {
                    if let Some(header) = matcher.column_header(table) {
                        debug!(
                            "{} table at 0x{:x}: column {} ({})",
                            stream.spec.name, base, header.id, header.signature
                        );
                        current = Some(header.id);
                    }

                    for block in locator.locate(table, base)? {
                        let values = locator.decode(&block)?;
                        let key = match &current {
                            Some(id) => ColumnKey::Id(id.clone()),
                            None => {
                                position += 1;
                                ColumnKey::Position(position - 1)
                            }
                        };
                        arrays.push(DecodedArray { key, values });
                    }
                }

                assembler.add_segment(SegmentOutput {
                    stream: stream.index,
                    arrays,
                    metadata,
                    fallback,
                })?;
            }
        }

        let hash = content_hash(present.iter().map(|s| s.data));
        let mut file = FileMetadata::new();
        file.insert("file_hash", file_hash_value(hash));
        assembler.add_metadata(file);

        assembler.finish(&config.required_fields)
    }

    /// Run the metadata patterns over every table of one buffer
    pub fn extract_metadata(&self, data: &[u8]) -> Result<FileMetadata> {
        let matcher = self.matcher();
        let mut metadata = FileMetadata::new();
        let mut fallback = FileMetadata::new();
        for table in split_tables_limited(
            data,
            &TABLE_SEPARATOR,
            self.config.limits.max_tables_per_stream,
        )? {
            metadata.merge(matcher.extract(table));
            fallback.fill(matcher.extract_fallbacks(table));
        }
        metadata.fill(fallback);
        Ok(metadata)
    }

    fn matcher(&self) -> PatternMatcher<'_> {
        PatternMatcher::new(
            &self.config.metadata,
            &self.config.column_signatures,
            &self.config.columns,
        )
    }

    fn present_streams<'s, S: StreamSource + ?Sized>(
        &self,
        source: &'s S,
    ) -> Result<Vec<Present<'s, '_>>> {
        let mut present = Vec::new();
        for (index, spec) in self.config.streams.iter().enumerate() {
            match source.stream(&spec.name) {
                Some(data) => present.push(Present { index, spec, data }),
                None if spec.required => return Err(Error::StreamNotFound(spec.name.clone())),
                None => debug!("Optional stream {} not present", spec.name),
            }
        }
        Ok(present)
    }

    fn check_size(&self, present: &[Present<'_, '_>]) -> Result<()> {
        let total: u64 = present.iter().map(|s| s.data.len() as u64).sum();
        let limit = self.config.limits.max_file_bytes;
        if total > limit {
            return Err(Error::ResourceLimit {
                what: "file size",
                limit,
                actual: total,
            });
        }
        Ok(())
    }

    /// Match the leading bytes of the first required stream
    fn check_version(&self, present: &[Present<'_, '_>]) -> Result<()> {
        let Some(stream) = present
            .iter()
            .find(|s| s.spec.required)
            .or_else(|| present.first())
        else {
            return Ok(());
        };

        match self
            .config
            .unsupported_versions
            .iter()
            .find(|v| stream.data.starts_with(&v.bytes))
        {
            Some(version) => Err(Error::UnsupportedVersion(version.label.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::block::{encode_block, UnknownTypePolicy};
    use crate::config::{VersionSignature, STREAM_DATA, STREAM_METADATA};
    use crate::pattern::{MetadataPattern, ValueKind};
    use crate::registry::{DecodeContext, ElementSize, TypeHandler, Values};
    use crate::string::{self, StringEncoding};
    use crate::{END_FIELD, END_TABLE, TYPE_FLOAT64, TYPE_PREFIX, TYPE_SEPARATOR, TYPE_STRING};

    const SAMPLE_SIG: [u8; 2] = [0xe1, 0x01];

    /// `category .. field TYPE_PREFIX type 80 01 value END_FIELD`
    fn typed(category: [u8; 2], field: [u8; 2], type_id: u8, value: &[u8]) -> Vec<u8> {
        [
            &category[..],
            &[0x00u8, 0x00],
            &field,
            &TYPE_PREFIX,
            &[type_id],
            &TYPE_SEPARATOR,
            value,
            &END_FIELD,
        ]
        .concat()
    }

    fn text(s: &str) -> Vec<u8> {
        string::encode(s, StringEncoding::Fffeff).unwrap()
    }

    /// Three tables; FFFEFF strings avoid length 4, which reads as a separator
    fn metadata_stream(instrument: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if instrument {
            out.extend(typed([0x75, 0x17], [0x59, 0x10], TYPE_STRING, &text("STA 449 F3")));
            out.extend(TABLE_SEPARATOR);
        }
        out.extend(typed([0x30, 0x75], [0x40, 0x08], TYPE_STRING, &text("Test Sample")));
        out.extend(typed([0x30, 0x75], [0x9e, 0x0c], TYPE_FLOAT64, &15.6f64.to_le_bytes()));
        out.extend(TABLE_SEPARATOR);
        out.extend(typed([0x72, 0x17], [0x35, 0x08], TYPE_STRING, &text("J. Smith")));
        out
    }

    /// One data table: `id 17` header, one f64 block, END_TABLE
    fn column_table(id: u8, values: &[f64]) -> Vec<u8> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut table = vec![id, 0x17, 0x00, 0x00];
        table.extend(encode_block(TYPE_FLOAT64, values.len() as u32, &payload));
        table.extend(END_TABLE);
        table
    }

    fn data_stream(tables: &[Vec<u8>]) -> Vec<u8> {
        tables.join(&TABLE_SEPARATOR[..])
    }

    fn streams(data: Vec<u8>) -> HashMap<String, Vec<u8>> {
        HashMap::from([
            (STREAM_METADATA.to_string(), metadata_stream(true)),
            (STREAM_DATA.to_string(), data),
        ])
    }

    fn sample_streams() -> HashMap<String, Vec<u8>> {
        streams(data_stream(&[
            column_table(0x8d, &[0.0, 0.5, 1.0]),
            column_table(0x8e, &[25.0, 26.0, 27.0]),
        ]))
    }

    #[test]
    fn test_parse_full_file() -> anyhow::Result<()> {
        let parser = Parser::new(ParserConfig::default())?;
        let table = parser.parse(&sample_streams())?;

        assert_eq!(table.column_names(), vec!["time", "sample_temperature"]);
        assert_eq!(table.num_rows(), 3);
        assert_eq!(
            table.column("sample_temperature").map(|c| &c.values),
            Some(&Values::Float64(vec![25.0, 26.0, 27.0]))
        );

        let meta = &table.metadata;
        assert_eq!(meta.get_str("instrument"), Some("STA 449 F3"));
        assert_eq!(meta.get_str("sample_name"), Some("Test Sample"));
        assert_eq!(meta.get_f64("sample_mass"), Some(15.6));
        assert_eq!(meta.get_str("operator"), Some("J. Smith"));
        assert_eq!(
            meta.get_path(&["file_hash", "method"]).and_then(|v| v.as_str()),
            Some("SHA-256")
        );
        let hash = meta.get_path(&["file_hash", "hash"]).and_then(|v| v.as_str());
        assert_eq!(hash.map(str::len), Some(64));
        Ok(())
    }

    #[test]
    fn test_hash_covers_every_stream() -> anyhow::Result<()> {
        let parser = Parser::new(ParserConfig::default())?;
        let a = parser.parse(&sample_streams())?;
        let b = parser.parse(&streams(data_stream(&[
            column_table(0x8d, &[0.0, 0.5, 2.0]),
            column_table(0x8e, &[25.0, 26.0, 27.0]),
        ])))?;
        assert_ne!(
            a.metadata.get_path(&["file_hash", "hash"]),
            b.metadata.get_path(&["file_hash", "hash"])
        );
        Ok(())
    }

    #[test]
    fn test_missing_required_stream() {
        let parser = Parser::new(ParserConfig::default()).unwrap();
        let mut files = sample_streams();
        files.remove(STREAM_METADATA);

        match parser.parse(&files) {
            Err(Error::StreamNotFound(name)) => assert_eq!(name, STREAM_METADATA),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_optional_stream_absent() {
        let parser = Parser::new(ParserConfig::default()).unwrap();
        let mut files = sample_streams();
        files.remove(STREAM_DATA);

        let table = parser.parse(&files).unwrap();
        assert_eq!(table.num_columns(), 0);
        assert!(table.metadata.contains("instrument"));
    }

    #[test]
    fn test_missing_instrument() {
        let parser = Parser::new(ParserConfig::default()).unwrap();
        let mut files = sample_streams();
        files.insert(STREAM_METADATA.to_string(), metadata_stream(false));

        match parser.parse(&files) {
            Err(Error::MetadataExtraction { missing }) => assert_eq!(missing, vec!["instrument"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_row_count_mismatch() {
        let parser = Parser::new(ParserConfig::default()).unwrap();
        let files = streams(data_stream(&[
            column_table(0x8d, &[0.0, 0.5, 1.0]),
            column_table(0x8e, &[25.0, 26.0]),
        ]));
        assert!(matches!(parser.parse(&files), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_unmapped_column_keeps_hex_id() {
        let parser = Parser::new(ParserConfig::default()).unwrap();
        let files = streams(data_stream(&[
            column_table(0x8d, &[0.0, 1.0]),
            column_table(0xab, &[7.0, 8.0]),
        ]));

        let table = parser.parse(&files).unwrap();
        let column = table.column("ab").unwrap();
        assert_eq!(column.source_id.as_deref(), Some("ab"));
        assert!(column.unit.is_none());
    }

    #[test]
    fn test_header_carries_to_next_table() {
        let parser = Parser::new(ParserConfig::default()).unwrap();
        let payload: Vec<u8> = [2.0f64, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut continuation = vec![0x00, 0x00];
        continuation.extend(encode_block(TYPE_FLOAT64, 2, &payload));

        let files = streams(data_stream(&[column_table(0x8d, &[0.0, 1.0]), continuation]));
        let table = parser.parse(&files).unwrap();
        assert_eq!(table.column_names(), vec!["time"]);
        assert_eq!(table.num_rows(), 4);
    }

    #[test]
    fn test_unknown_type_policy() {
        let mut bad = vec![0x8d, 0x17];
        bad.extend(encode_block(0xff, 1, &[0u8; 8]));
        let files = streams(data_stream(&[bad]));

        let parser = Parser::new(ParserConfig::default()).unwrap();
        assert!(matches!(
            parser.parse(&files),
            Err(Error::UnsupportedDataType { type_id: 0xff, .. })
        ));

        let config = ParserConfig {
            unknown_types: UnknownTypePolicy::Skip,
            ..ParserConfig::default()
        };
        let table = Parser::new(config).unwrap().parse(&files).unwrap();
        assert_eq!(table.num_columns(), 0);
    }

    #[test]
    fn test_unsupported_version() {
        let mut config = ParserConfig::default();
        config.unsupported_versions.push(VersionSignature {
            label: "legacy".into(),
            bytes: [0x75, 0x17].into(),
        });
        let parser = Parser::new(config).unwrap();

        match parser.parse(&sample_streams()) {
            Err(Error::UnsupportedVersion(label)) => assert_eq!(label, "legacy"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_file_size_limit() {
        let mut config = ParserConfig::default();
        config.limits.max_file_bytes = 64;
        let parser = Parser::new(config).unwrap();

        assert!(matches!(
            parser.parse(&sample_streams()),
            Err(Error::ResourceLimit { what: "file size", .. })
        ));
    }

    #[test]
    fn test_table_limit() {
        let mut config = ParserConfig::default();
        config.limits.max_tables_per_stream = 1;
        let parser = Parser::new(config).unwrap();

        assert!(matches!(
            parser.parse(&sample_streams()),
            Err(Error::ResourceLimit { what: "tables per stream", .. })
        ));
    }

    #[test]
    fn test_element_limit() {
        let mut config = ParserConfig::default();
        config.limits.max_elements_per_block = 2;
        let parser = Parser::new(config).unwrap();

        assert!(matches!(
            parser.parse(&sample_streams()),
            Err(Error::ResourceLimit { what: "elements per block", .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ParserConfig::default();
        config.columns = config.columns.with("xyz", "bad", None);
        assert!(matches!(Parser::new(config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_custom_registry() {
        fn decode_i16(payload: &[u8], _: u32, _: &DecodeContext) -> crate::Result<Values> {
            Ok(Values::Int32(
                payload
                    .chunks_exact(2)
                    .map(|c| i32::from(i16::from_le_bytes([c[0], c[1]])))
                    .collect(),
            ))
        }
        fn encode_i16(_: &Values, _: StringEncoding) -> crate::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        let registry = Registry::builder()
            .register(TypeHandler {
                id: 0x05,
                name: "int16",
                size: ElementSize::Fixed(2),
                decode: decode_i16,
                encode: encode_i16,
            })
            .unwrap()
            .build();

        let mut table = vec![0x87, 0x17];
        table.extend(encode_block(0x05, 2, &[0xff, 0xff, 0x02, 0x00]));
        let files = streams(data_stream(&[table]));

        let parser = Parser::with_registry(ParserConfig::default(), registry).unwrap();
        let parsed = parser.parse(&files).unwrap();
        assert_eq!(parsed.column("mass").unwrap().values, Values::Int32(vec![-1, 2]));
    }

    #[test]
    fn test_rebuilt_parser_leaves_original_alone() {
        let parser = Parser::new(ParserConfig::default()).unwrap();

        let mut config = parser.config().clone();
        config.columns = config.columns.with("8d", "elapsed", Some("s"));
        let renamed = Parser::new(config).unwrap();

        let files = sample_streams();
        assert!(renamed.parse(&files).unwrap().column("elapsed").is_some());
        assert!(parser.parse(&files).unwrap().column("time").is_some());
    }

    #[test]
    fn test_shared_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Parser>();

        let parser = Parser::new(ParserConfig::default()).unwrap();
        let files = sample_streams();
        let expected = parser.parse(&files).unwrap();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| parser.parse(&files).unwrap()))
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), expected);
            }
        });
    }

    #[test]
    fn test_data_stream_metadata_ignored() -> anyhow::Result<()> {
        let bogus = typed([0x75, 0x17], [0x59, 0x10], TYPE_STRING, &text("bogus"));
        let files = streams(data_stream(&[column_table(0x8d, &[0.0, 1.0]), bogus]));

        let parser = Parser::new(ParserConfig::default())?;
        let table = parser.parse(&files)?;
        assert_eq!(table.metadata.get_str("instrument"), Some("STA 449 F3"));

        // Opting the data stream in lets its later table win
        let mut config = ParserConfig::default();
        config.streams[1].metadata = true;
        let table = Parser::new(config)?.parse(&files)?;
        assert_eq!(table.metadata.get_str("instrument"), Some("bogus"));
        Ok(())
    }

    fn crucible_config() -> ParserConfig {
        let crucible = |name: &str| {
            MetadataPattern::new(name, [0x7e, 0x08], END_FIELD, ValueKind::Float)
                .value_start(TYPE_SEPARATOR)
        };
        let mut config = ParserConfig::default();
        config.metadata.extend([
            crucible("crucible_mass").preceded_by(SAMPLE_SIG, 64),
            crucible("crucible_mass").fallback(),
            crucible("reference_crucible_mass").zero_only().fallback(),
        ]);
        config
    }

    /// Unsigned zero crucible first, sample crucible in a later table
    fn crucible_stream() -> Vec<u8> {
        let mut out = metadata_stream(true);
        out.extend(TABLE_SEPARATOR);
        out.extend(typed([0x30, 0x75], [0x7e, 0x08], TYPE_FLOAT64, &0.0f64.to_le_bytes()));
        out.extend(TABLE_SEPARATOR);
        out.extend(SAMPLE_SIG);
        out.extend(typed([0x30, 0x75], [0x7e, 0x08], TYPE_FLOAT64, &60.5f64.to_le_bytes()));
        out
    }

    #[test]
    fn test_crucible_fallbacks_across_tables() -> anyhow::Result<()> {
        let parser = Parser::new(crucible_config())?;
        let mut files = sample_streams();
        files.insert(STREAM_METADATA.to_string(), crucible_stream());

        let meta = parser.parse(&files)?.metadata;
        assert_eq!(meta.get_f64("crucible_mass"), Some(60.5));
        assert_eq!(meta.get_f64("reference_crucible_mass"), Some(0.0));

        let meta = parser.extract_metadata(&crucible_stream())?;
        assert_eq!(meta.get_f64("crucible_mass"), Some(60.5));
        assert_eq!(meta.get_f64("reference_crucible_mass"), Some(0.0));
        Ok(())
    }

    #[test]
    fn test_extract_metadata_only() {
        let parser = Parser::new(ParserConfig::default()).unwrap();
        let meta = parser.extract_metadata(&metadata_stream(true)).unwrap();
        assert_eq!(meta.get_str("instrument"), Some("STA 449 F3"));
        assert!(!meta.contains("file_hash"));
    }
}
