//! Container format for quill data files
//!
//! File structure:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Header (length-prefixed MsgPack)       │
//! │  - Magic, Version, Schema, Codec        │
//! ├─────────────────────────────────────────┤
//! │  Record Block 1                         │
//! │  - Length prefix (u32 LE)               │
//! │  - Codec-encoded record payload         │
//! ├─────────────────────────────────────────┤
//! │  ...                                    │
//! ├─────────────────────────────────────────┤
//! │  Footer (fixed 64 bytes)                │
//! │  - Magic, checksum, completion flag     │
//! └─────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use xxhash_rust::xxh64::Xxh64;

use super::codec::Codec;
use crate::common::{Schema, MAX_RECORD_SIZE};

/// Magic bytes for quill data files
pub const FILE_MAGIC: [u8; 8] = *b"QUILL001";

/// Current file format version
pub const FORMAT_VERSION: u32 = 1;

/// Footer magic bytes (different from header to detect truncation)
pub const FOOTER_MAGIC: [u8; 8] = *b"QLEND001";

/// Fixed footer size in bytes
pub const FOOTER_SIZE: usize = 64;

/// Length prefix size of every block
pub const BLOCK_PREFIX_SIZE: u64 = 4;

/// Largest block a reader accepts (compressed blocks may exceed the payload)
pub const MAX_BLOCK_SIZE: usize = MAX_RECORD_SIZE + MAX_RECORD_SIZE / 64;

const CHECKSUM_SEED: u64 = 0;

fn unix_nanos(time: DateTime<Utc>) -> u64 {
    time.timestamp_nanos_opt().unwrap_or_default().max(0) as u64
}

/// File header describing the records that follow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Format version
    pub version: u32,

    /// Schema name
    pub schema_name: String,

    /// Canonical schema JSON
    pub schema_json: String,

    /// xxHash64 of the canonical schema JSON
    pub schema_fingerprint: u64,

    /// Block codec (`none`, `lz4`, `zstd:<level>`)
    pub codec: String,

    /// Position of this file in the writer's output (0 = initial file)
    pub file_sequence: u32,

    /// File creation time (Unix timestamp in nanoseconds)
    pub file_start_time_ns: u64,

    /// Additional key-value metadata
    pub metadata: HashMap<String, String>,
}

impl FileHeader {
    pub fn new(schema: &Schema, codec: Codec, file_sequence: u32, created: DateTime<Utc>) -> Self {
        Self {
            version: FORMAT_VERSION,
            schema_name: schema.name().to_string(),
            schema_json: schema.to_json(),
            schema_fingerprint: schema.fingerprint(),
            codec: codec.to_string(),
            file_sequence,
            file_start_time_ns: unix_nanos(created),
            metadata: HashMap::new(),
        }
    }

    /// Codec the blocks of this file were written with
    pub fn codec(&self) -> Result<Codec, FileFormatError> {
        self.codec.parse()
    }

    /// Re-parse the embedded schema
    pub fn schema(&self) -> Result<Schema, FileFormatError> {
        Schema::parse(&self.schema_json).map_err(|e| FileFormatError::InvalidSchema(e.to_string()))
    }

    /// Serialize header to bytes (with magic prefix)
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let header_bytes = rmp_serde::to_vec(self)?;
        let mut buf = Vec::with_capacity(12 + header_bytes.len());
        buf.extend_from_slice(&FILE_MAGIC);
        buf.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        Ok(buf)
    }

    /// Deserialize header from bytes (expects magic prefix)
    pub fn from_bytes(data: &[u8]) -> Result<Self, FileFormatError> {
        if data.len() < 12 {
            return Err(FileFormatError::TooShort);
        }
        if data[0..8] != FILE_MAGIC {
            return Err(FileFormatError::InvalidMagic);
        }

        let len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if data.len() < 12 + len {
            return Err(FileFormatError::TooShort);
        }

        let header: Self = rmp_serde::from_slice(&data[12..12 + len])?;
        header.check_version()
    }

    fn check_version(self) -> Result<Self, FileFormatError> {
        if self.version != FORMAT_VERSION {
            return Err(FileFormatError::UnsupportedVersion(self.version));
        }
        Ok(self)
    }

    /// Write header to a writer, returning the bytes written
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize, FileFormatError> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(bytes.len())
    }

    /// Read header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FileFormatError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != FILE_MAGIC {
            return Err(FileFormatError::InvalidMagic);
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let header: Self = rmp_serde::from_slice(&data)?;
        header.check_version()
    }
}

/// File footer containing checksums and completion status
///
/// Fixed 64-byte structure for easy seeking to file end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileFooter {
    /// Footer magic bytes (8 bytes)
    pub magic: [u8; 8],

    /// xxHash64 over all blocks, length prefixes included
    pub data_checksum: u64,

    /// Number of records written
    pub record_count: u64,

    /// Total bytes of blocks (excluding header and footer)
    pub data_bytes: u64,

    /// Ring sequence of the first record (`u64::MAX` when empty)
    pub first_sequence: u64,

    /// Ring sequence of the last record
    pub last_sequence: u64,

    /// File end time (Unix timestamp in nanoseconds)
    pub file_end_time_ns: u64,

    /// Write completion flag (1 = complete, 0 = incomplete/crashed)
    pub write_complete: u8,

    /// Reserved for future use
    _reserved: [u8; 7],
}

impl Default for FileFooter {
    fn default() -> Self {
        Self::new()
    }
}

impl FileFooter {
    pub fn new() -> Self {
        Self {
            magic: FOOTER_MAGIC,
            data_checksum: 0,
            record_count: 0,
            data_bytes: 0,
            first_sequence: u64::MAX,
            last_sequence: 0,
            file_end_time_ns: 0,
            write_complete: 0,
            _reserved: [0u8; 7],
        }
    }

    /// Account for one record
    pub fn record(&mut self, sequence: u64) {
        if self.record_count == 0 {
            self.first_sequence = sequence;
        }
        self.last_sequence = sequence;
        self.record_count += 1;
    }

    /// First and last ring sequence in this file
    pub fn sequence_range(&self) -> Option<(u64, u64)> {
        (self.record_count > 0).then_some((self.first_sequence, self.last_sequence))
    }

    /// Mark as complete and set end time
    pub fn finalize(&mut self, end: DateTime<Utc>) {
        self.write_complete = 1;
        self.file_end_time_ns = unix_nanos(end);
    }

    pub fn is_complete(&self) -> bool {
        self.write_complete == 1
    }

    /// Serialize footer to fixed 64-byte array
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..16].copy_from_slice(&self.data_checksum.to_le_bytes());
        buf[16..24].copy_from_slice(&self.record_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_bytes.to_le_bytes());
        buf[32..40].copy_from_slice(&self.first_sequence.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_sequence.to_le_bytes());
        buf[48..56].copy_from_slice(&self.file_end_time_ns.to_le_bytes());
        buf[56] = self.write_complete;
        // Reserved (7 bytes) - already zeroed
        buf
    }

    /// Deserialize footer from 64-byte array
    pub fn from_bytes(data: &[u8; FOOTER_SIZE]) -> Result<Self, FileFormatError> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[0..8]);
        if magic != FOOTER_MAGIC {
            return Err(FileFormatError::InvalidFooterMagic);
        }

        let word = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };

        Ok(Self {
            magic,
            data_checksum: word(8),
            record_count: word(16),
            data_bytes: word(24),
            first_sequence: word(32),
            last_sequence: word(40),
            file_end_time_ns: word(48),
            write_complete: data[56],
            _reserved: [0u8; 7],
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), FileFormatError> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, FileFormatError> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}

/// Streaming xxHash64 over the block region
#[derive(Clone)]
pub struct ChecksumCalculator {
    hasher: Xxh64,
    bytes_processed: u64,
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChecksumCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumCalculator")
            .field("bytes_processed", &self.bytes_processed)
            .finish()
    }
}

impl ChecksumCalculator {
    pub fn new() -> Self {
        Self {
            hasher: Xxh64::new(CHECKSUM_SEED),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    /// Checksum of everything seen so far
    pub fn finalize(&self) -> u64 {
        self.hasher.digest()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn reset(&mut self) {
        self.hasher.reset(CHECKSUM_SEED);
        self.bytes_processed = 0;
    }
}

/// File format errors
#[derive(Debug, thiserror::Error)]
pub enum FileFormatError {
    #[error("Data too short to contain valid structure")]
    TooShort,

    #[error("Invalid file magic bytes")]
    InvalidMagic,

    #[error("Invalid footer magic bytes")]
    InvalidFooterMagic,

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("Unknown codec '{0}'")]
    UnknownCodec(String),

    #[error("Invalid schema in header: {0}")]
    InvalidSchema(String),

    #[error("Block of {0} bytes does not fit a length prefix")]
    BlockTooLarge(usize),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("Incomplete file (footer indicates crash during write)")]
    IncompleteFile,
}

/// Open container file on the writer side
///
/// Owned by the consumer thread only. Blocks are buffered; `flush` pushes
/// them to the OS and `finish` writes the footer and syncs to disk.
///
/// A failed append may leave part of its block behind. The writer is then
/// poisoned and the next operation cuts the file back to the end of the last
/// whole block before writing anything else.
#[derive(Debug)]
pub struct ContainerWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    checksum: ChecksumCalculator,
    footer: FileFooter,
    header_size: u64,
    poisoned: bool,
}

impl ContainerWriter {
    /// Create (truncating) `path` and write `header`
    pub fn create(path: &Path, header: &FileHeader) -> Result<Self, FileFormatError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        let header_size = header.write_to(&mut writer)? as u64;

        info!(
            path = %path.display(),
            sequence = header.file_sequence,
            codec = %header.codec,
            header_size,
            "Opened new data file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            checksum: ChecksumCalculator::new(),
            footer: FileFooter::new(),
            header_size,
            poisoned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u64 {
        self.footer.record_count
    }

    /// Bytes of blocks appended so far
    pub fn data_bytes(&self) -> u64 {
        self.checksum.bytes_processed()
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// True after a failed append until the file has been repaired
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// File length covering the header and every whole block
    fn committed_len(&self) -> u64 {
        self.header_size + self.checksum.bytes_processed()
    }

    /// Append one encoded block, returning its size with the prefix
    pub fn append(&mut self, sequence: u64, block: &[u8]) -> Result<u64, FileFormatError> {
        let len = u32::try_from(block.len()).map_err(|_| FileFormatError::BlockTooLarge(block.len()))?;
        let prefix = len.to_le_bytes();

        if self.poisoned {
            self.repair()?;
        }
        let written = match self.writer.write_all(&prefix) {
            Ok(()) => self.writer.write_all(block),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.poisoned = true;
            warn!(
                path = %self.path.display(),
                sequence,
                error = %e,
                "Block write failed, file will be cut back before the next write"
            );
            return Err(e.into());
        }

        self.checksum.update(&prefix);
        self.checksum.update(block);
        self.footer.record(sequence);

        Ok(BLOCK_PREFIX_SIZE + block.len() as u64)
    }

    /// Push buffered blocks to the OS
    pub fn flush(&mut self) -> Result<(), FileFormatError> {
        if self.poisoned {
            return self.repair();
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Drop whatever a failed append left past the last whole block
    ///
    /// Buffered bytes go out first so nothing lands after the cut.
    fn repair(&mut self) -> Result<(), FileFormatError> {
        self.writer.flush()?;
        let committed = self.committed_len();
        let file = self.writer.get_mut();
        file.set_len(committed)?;
        file.seek(SeekFrom::Start(committed))?;
        self.poisoned = false;

        info!(
            path = %self.path.display(),
            length = committed,
            "Cut data file back to last whole block"
        );
        Ok(())
    }

    /// Write the footer, flush and fsync; the file is closed on return
    pub fn finish(mut self, end: DateTime<Utc>) -> Result<FileFooter, FileFormatError> {
        if self.poisoned {
            self.repair()?;
        }
        self.footer.data_checksum = self.checksum.finalize();
        self.footer.data_bytes = self.checksum.bytes_processed();
        self.footer.finalize(end);

        self.footer.write_to(&mut self.writer)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        info!(
            path = %self.path.display(),
            size_mb = (self.header_size + self.footer.data_bytes + FOOTER_SIZE as u64) as f64
                / 1_000_000.0,
            records = self.footer.record_count,
            checksum = format!("{:016x}", self.footer.data_checksum),
            "Closed data file"
        );

        Ok(self.footer)
    }
}

/// Result of file validation
#[derive(Debug)]
pub struct FileValidationResult {
    /// Footer complete, checksum and record count match
    pub is_valid: bool,
    /// Header information (if readable)
    pub header: Option<FileHeader>,
    /// Footer information (if readable)
    pub footer: Option<FileFooter>,
    /// Blocks readable from the start of the data region
    pub recoverable_records: u64,
    /// Validation errors encountered
    pub errors: Vec<String>,
}

impl FileValidationResult {
    /// Check if file needs recovery (has data but incomplete)
    pub fn needs_recovery(&self) -> bool {
        !self.is_valid && self.recoverable_records > 0
    }
}

/// Reader for quill data files with recovery support
pub struct DataFileReader<R> {
    reader: R,
    header: FileHeader,
    codec: Codec,
    footer: Option<FileFooter>,
    header_size: u64,
    file_size: u64,
}

impl DataFileReader<BufReader<File>> {
    /// Open a data file on disk
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FileFormatError> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> DataFileReader<R> {
    /// Read the header; the footer is read lazily
    pub fn new(mut reader: R) -> Result<Self, FileFormatError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let header = FileHeader::read_from(&mut reader)?;
        let codec = header.codec()?;
        let header_size = reader.stream_position()?;

        Ok(Self {
            reader,
            header,
            codec,
            footer: None,
            header_size,
            file_size,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn footer(&self) -> Option<&FileFooter> {
        self.footer.as_ref()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Try to read the footer (fails for files still being written)
    pub fn read_footer(&mut self) -> Result<FileFooter, FileFormatError> {
        if self.file_size < self.header_size + FOOTER_SIZE as u64 {
            return Err(FileFormatError::TooShort);
        }
        self.reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let footer = FileFooter::read_from(&mut self.reader)?;
        self.footer = Some(footer);
        Ok(footer)
    }

    /// End of the block region, assuming a footer is present if it fits
    fn data_end(&self) -> u64 {
        if self.footer.is_some() || self.file_size >= self.header_size + FOOTER_SIZE as u64 {
            self.file_size - FOOTER_SIZE as u64
        } else {
            self.file_size
        }
    }

    /// Validate footer, checksum and record count
    pub fn validate(&mut self) -> FileValidationResult {
        let mut result = FileValidationResult {
            is_valid: false,
            header: Some(self.header.clone()),
            footer: None,
            recoverable_records: 0,
            errors: Vec::new(),
        };

        match self.read_footer() {
            Ok(footer) => {
                result.footer = Some(footer);
                if !footer.is_complete() {
                    result
                        .errors
                        .push("File incomplete (crash during write)".to_string());
                }
            }
            Err(e) => result.errors.push(format!("Failed to read footer: {}", e)),
        }

        let scan = self.scan_blocks();
        result.recoverable_records = scan.blocks;
        if let Some(e) = &scan.error {
            result.errors.push(format!("Block scan stopped: {}", e));
        }

        if let Some(footer) = result.footer {
            if footer.is_complete() {
                let actual = scan.checksum.finalize();
                if actual != footer.data_checksum {
                    result.errors.push(
                        FileFormatError::ChecksumMismatch {
                            expected: footer.data_checksum,
                            actual,
                        }
                        .to_string(),
                    );
                } else if scan.blocks != footer.record_count {
                    result.errors.push(format!(
                        "Record count mismatch: footer {}, found {}",
                        footer.record_count, scan.blocks
                    ));
                } else if scan.error.is_none() {
                    result.is_valid = true;
                }
            }
        }

        result
    }

    /// Walk every block, decoding it, and checksum the region
    fn scan_blocks(&mut self) -> BlockScan {
        let codec = self.codec;
        let mut scan = BlockScan {
            blocks: 0,
            checksum: ChecksumCalculator::new(),
            error: None,
        };

        let mut blocks = self.raw_blocks();
        loop {
            match blocks.next_block() {
                Ok(Some((prefix, block))) => {
                    if let Err(e) = codec.decode(&block) {
                        scan.error = Some(e);
                        break;
                    }
                    scan.checksum.update(&prefix);
                    scan.checksum.update(&block);
                    scan.blocks += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    scan.error = Some(e);
                    break;
                }
            }
        }
        scan
    }

    fn raw_blocks(&mut self) -> RawBlocks<'_, R> {
        let data_end = self.data_end();
        RawBlocks {
            reader: &mut self.reader,
            position: self.header_size,
            data_end,
            sought: false,
        }
    }

    /// Iterate the decoded record payloads in write order
    pub fn records(&mut self) -> RecordIterator<'_, R> {
        let codec = self.codec;
        RecordIterator {
            blocks: self.raw_blocks(),
            codec,
            done: false,
        }
    }
}

struct BlockScan {
    blocks: u64,
    checksum: ChecksumCalculator,
    error: Option<FileFormatError>,
}

struct RawBlocks<'a, R> {
    reader: &'a mut R,
    position: u64,
    data_end: u64,
    sought: bool,
}

impl<R: Read + Seek> RawBlocks<'_, R> {
    /// Next `(prefix, block)`; `None` at the end of the block region
    fn next_block(&mut self) -> Result<Option<([u8; 4], Vec<u8>)>, FileFormatError> {
        if !self.sought {
            self.reader.seek(SeekFrom::Start(self.position))?;
            self.sought = true;
        }
        if self.position >= self.data_end {
            return Ok(None);
        }
        if self.position + BLOCK_PREFIX_SIZE > self.data_end {
            return Err(FileFormatError::TooShort);
        }

        let mut prefix = [0u8; 4];
        self.reader.read_exact(&mut prefix)?;
        let len = u32::from_le_bytes(prefix) as usize;
        if len == 0 || len > MAX_BLOCK_SIZE {
            return Err(FileFormatError::BlockTooLarge(len));
        }
        if self.position + BLOCK_PREFIX_SIZE + len as u64 > self.data_end {
            return Err(FileFormatError::TooShort);
        }

        let mut block = vec![0u8; len];
        self.reader.read_exact(&mut block)?;
        self.position += BLOCK_PREFIX_SIZE + len as u64;
        Ok(Some((prefix, block)))
    }
}

/// Iterator over decoded record payloads
pub struct RecordIterator<'a, R> {
    blocks: RawBlocks<'a, R>,
    codec: Codec,
    done: bool,
}

impl<R: Read + Seek> Iterator for RecordIterator<'_, R> {
    type Item = Result<Vec<u8>, FileFormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = match self.blocks.next_block() {
            Ok(Some((_, block))) => self.codec.decode(&block).map(|payload| payload.into_owned()),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}
