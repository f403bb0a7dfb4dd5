use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes for trace dataset files.
pub const MAGIC: &[u8; 8] = b"IOAT1\n\x00\x00";

pub const VERSION: u16 = 1;

/// Fixed size of the file header in bytes.
///   magic[8] + version:u16 + table_count:u16 + reserved:u32 + checksum:u64
///   = 8 + 2 + 2 + 4 + 8 = 24
pub const HEADER_SIZE: u64 = 24;

/// Size of one table directory entry in bytes.
///   name[24] + record_size:u32 + reserved:u32 + record_count:u64 + data_offset:u64
///   = 24 + 4 + 4 + 8 + 8 = 48
pub const TABLE_ENTRY_SIZE: u64 = 48;

const TABLE_NAME_LEN: usize = 24;

/// Width of the name-like string columns (99 characters + NUL).
pub const NAME_LEN: usize = 100;

/// Width of the datatype column.
pub const DATATYPE_LEN: usize = 128;

// ── Tables ─────────────────────────────────────────────────────────────────

/// The three record tables, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    IoTrace,
    CompressionTrace,
    Evaluation,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::IoTrace, Table::CompressionTrace, Table::Evaluation];

    pub fn name(self) -> &'static str {
        match self {
            Table::IoTrace => "IO-Trace",
            Table::CompressionTrace => "Compression-Trace",
            Table::Evaluation => "Evaluation",
        }
    }

    pub fn record_size(self) -> u32 {
        match self {
            Table::IoTrace => IoTraceRow::SIZE as u32,
            Table::CompressionTrace => CompressionTraceRow::SIZE as u32,
            Table::Evaluation => EvaluationRow::SIZE as u32,
        }
    }

    fn index(self) -> usize {
        match self {
            Table::IoTrace => 0,
            Table::CompressionTrace => 1,
            Table::Evaluation => 2,
        }
    }
}

/// Directory entry locating one table's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub name: String,
    pub record_size: u32,
    pub record_count: u64,
    /// Byte offset of row 0 from the start of the file.
    pub data_offset: u64,
}

impl TableEntry {
    pub fn data_len(&self) -> u64 {
        self.record_size as u64 * self.record_count
    }

    /// File position of row `row`.
    pub fn row_offset(&self, row: u64) -> u64 {
        self.data_offset + row * self.record_size as u64
    }

    fn to_bytes(&self) -> [u8; TABLE_ENTRY_SIZE as usize] {
        let mut buf = [0u8; TABLE_ENTRY_SIZE as usize];
        put_str(&mut buf[..TABLE_NAME_LEN], &self.name);
        buf[24..28].copy_from_slice(&self.record_size.to_le_bytes());
        // buf[28..32] reserved
        buf[32..40].copy_from_slice(&self.record_count.to_le_bytes());
        buf[40..48].copy_from_slice(&self.data_offset.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            name: get_str(&buf[..TABLE_NAME_LEN])?,
            record_size: u32::from_le_bytes(buf[24..28].try_into()?),
            record_count: u64::from_le_bytes(buf[32..40].try_into()?),
            data_offset: u64::from_le_bytes(buf[40..48].try_into()?),
        })
    }
}

// ── Layout ─────────────────────────────────────────────────────────────────

/// Header plus directory. Fully determined by the global row counts, so
/// every rank computes the same layout without further exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub version: u16,
    pub tables: Vec<TableEntry>,
}

impl Layout {
    /// Layout for `counts` rows of each table, indexed as [`Table::ALL`].
    pub fn new(counts: [u64; 3]) -> Self {
        let mut data_offset = HEADER_SIZE + TABLE_ENTRY_SIZE * Table::ALL.len() as u64;
        let tables = Table::ALL
            .iter()
            .zip(counts)
            .map(|(table, record_count)| {
                let entry = TableEntry {
                    name: table.name().to_string(),
                    record_size: table.record_size(),
                    record_count,
                    data_offset,
                };
                data_offset += entry.data_len();
                entry
            })
            .collect();
        Self {
            version: VERSION,
            tables,
        }
    }

    pub fn entry(&self, table: Table) -> &TableEntry {
        &self.tables[table.index()]
    }

    pub fn prefix_len(&self) -> u64 {
        HEADER_SIZE + TABLE_ENTRY_SIZE * self.tables.len() as u64
    }

    /// Total file length once every row is written.
    pub fn file_len(&self) -> u64 {
        self.prefix_len() + self.tables.iter().map(TableEntry::data_len).sum::<u64>()
    }

    /// Header and directory, with the checksum filled in.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.prefix_len() as usize);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.tables.len() as u16).to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&[0u8; 8]);
        for entry in &self.tables {
            buf.extend_from_slice(&entry.to_bytes());
        }
        let checksum = prefix_checksum(&buf);
        buf[16..24].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse the fixed header, returning the table count it announces.
    pub fn parse_header(buf: &[u8; HEADER_SIZE as usize]) -> anyhow::Result<(u16, u16)> {
        if &buf[..8] != MAGIC {
            anyhow::bail!("invalid magic bytes, not an IOA trace dataset");
        }
        let version = u16::from_le_bytes(buf[8..10].try_into()?);
        let table_count = u16::from_le_bytes(buf[10..12].try_into()?);
        Ok((version, table_count))
    }

    /// Parse header + directory and verify the checksum.
    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        let header: &[u8; HEADER_SIZE as usize] = buf
            .get(..HEADER_SIZE as usize)
            .ok_or_else(|| anyhow::anyhow!("truncated header"))?
            .try_into()?;
        let (version, table_count) = Self::parse_header(header)?;
        if version != VERSION {
            anyhow::bail!(
                "unsupported dataset version {} (only {} is supported)",
                version,
                VERSION
            );
        }

        let prefix_len = (HEADER_SIZE + TABLE_ENTRY_SIZE * table_count as u64) as usize;
        if buf.len() < prefix_len {
            anyhow::bail!("truncated table directory");
        }
        let stored = u64::from_le_bytes(buf[16..24].try_into()?);
        let computed = prefix_checksum(&buf[..prefix_len]);
        if stored != computed {
            anyhow::bail!(
                "directory checksum mismatch: expected {:016x}, got {:016x}",
                stored,
                computed
            );
        }

        let tables = buf[HEADER_SIZE as usize..prefix_len]
            .chunks_exact(TABLE_ENTRY_SIZE as usize)
            .map(TableEntry::from_bytes)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mismatched = tables
            .iter()
            .zip(Table::ALL)
            .any(|(e, t)| e.name != t.name() || e.record_size != t.record_size());
        if tables.len() != Table::ALL.len() || mismatched {
            anyhow::bail!("unexpected table directory: {:?}", tables);
        }
        Ok(Self { version, tables })
    }
}

/// xxh3 over the header (checksum field excluded) and directory.
fn prefix_checksum(prefix: &[u8]) -> u64 {
    let mut hashed = Vec::with_capacity(prefix.len() - 8);
    hashed.extend_from_slice(&prefix[..16]);
    hashed.extend_from_slice(&prefix[24..]);
    xxh3_64(&hashed)
}

// ── Rows ───────────────────────────────────────────────────────────────────

/// A fixed-width record of one table.
pub trait Row: Sized {
    const TABLE: Table;
    const SIZE: usize;

    fn encode(&self, out: &mut Vec<u8>);

    fn decode(buf: &[u8]) -> anyhow::Result<Self>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct IoTraceRow {
    pub operation: String,
    pub timestamp: i64,
    pub duration_us: i64,
    pub datatype: String,
    pub offset: i64,
    pub count: i32,
    pub size: u64,
    pub rank: i32,
}

impl Row for IoTraceRow {
    const TABLE: Table = Table::IoTrace;
    // 100 + 8 + 8 + 128 + 8 + 4 + 8 + 4
    const SIZE: usize = 268;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Fields::new(out);
        w.str(&self.operation, NAME_LEN);
        w.i64(self.timestamp);
        w.i64(self.duration_us);
        w.str(&self.datatype, DATATYPE_LEN);
        w.i64(self.offset);
        w.i32(self.count);
        w.u64(self.size);
        w.i32(self.rank);
    }

    fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let mut r = Cursor::new(buf, Self::SIZE)?;
        Ok(Self {
            operation: r.str(NAME_LEN)?,
            timestamp: r.i64()?,
            duration_us: r.i64()?,
            datatype: r.str(DATATYPE_LEN)?,
            offset: r.i64()?,
            count: r.i32()?,
            size: r.u64()?,
            rank: r.i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionTraceRow {
    pub operation: String,
    pub timestamp: i64,
    pub chunk: String,
    pub duration_us: i64,
    pub datatype: String,
    pub offset: i64,
    pub count: i32,
    pub size: u64,
    pub rank: i32,
    pub codec: String,
    pub level: i32,
    pub metric: String,
    pub value: f32,
}

impl Row for CompressionTraceRow {
    const TABLE: Table = Table::CompressionTrace;
    // 100 + 8 + 100 + 8 + 128 + 8 + 4 + 8 + 4 + 100 + 4 + 100 + 4
    const SIZE: usize = 576;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Fields::new(out);
        w.str(&self.operation, NAME_LEN);
        w.i64(self.timestamp);
        w.str(&self.chunk, NAME_LEN);
        w.i64(self.duration_us);
        w.str(&self.datatype, DATATYPE_LEN);
        w.i64(self.offset);
        w.i32(self.count);
        w.u64(self.size);
        w.i32(self.rank);
        w.str(&self.codec, NAME_LEN);
        w.i32(self.level);
        w.str(&self.metric, NAME_LEN);
        w.f32(self.value);
    }

    fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let mut r = Cursor::new(buf, Self::SIZE)?;
        Ok(Self {
            operation: r.str(NAME_LEN)?,
            timestamp: r.i64()?,
            chunk: r.str(NAME_LEN)?,
            duration_us: r.i64()?,
            datatype: r.str(DATATYPE_LEN)?,
            offset: r.i64()?,
            count: r.i32()?,
            size: r.u64()?,
            rank: r.i32()?,
            codec: r.str(NAME_LEN)?,
            level: r.i32()?,
            metric: r.str(NAME_LEN)?,
            value: r.f32()?,
        })
    }
}

/// Predicted vs. best-found codec. The tested columns are empty/zero when
/// nothing beat the prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRow {
    pub timestamp: i64,
    pub rank: i32,
    pub size: u64,
    pub metric: String,
    pub predicted_codec: String,
    pub predicted_level: i32,
    pub predicted_value: f32,
    pub predicted_size: u64,
    pub tested_codec: String,
    pub tested_level: i32,
    pub tested_value: f32,
    pub tested_size: u64,
}

impl Row for EvaluationRow {
    const TABLE: Table = Table::Evaluation;
    // 8 + 4 + 8 + 100 + (100 + 4 + 4 + 8) * 2
    const SIZE: usize = 352;

    fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Fields::new(out);
        w.i64(self.timestamp);
        w.i32(self.rank);
        w.u64(self.size);
        w.str(&self.metric, NAME_LEN);
        w.str(&self.predicted_codec, NAME_LEN);
        w.i32(self.predicted_level);
        w.f32(self.predicted_value);
        w.u64(self.predicted_size);
        w.str(&self.tested_codec, NAME_LEN);
        w.i32(self.tested_level);
        w.f32(self.tested_value);
        w.u64(self.tested_size);
    }

    fn decode(buf: &[u8]) -> anyhow::Result<Self> {
        let mut r = Cursor::new(buf, Self::SIZE)?;
        Ok(Self {
            timestamp: r.i64()?,
            rank: r.i32()?,
            size: r.u64()?,
            metric: r.str(NAME_LEN)?,
            predicted_codec: r.str(NAME_LEN)?,
            predicted_level: r.i32()?,
            predicted_value: r.f32()?,
            predicted_size: r.u64()?,
            tested_codec: r.str(NAME_LEN)?,
            tested_level: r.i32()?,
            tested_value: r.f32()?,
            tested_size: r.u64()?,
        })
    }
}

// ── Field codecs ───────────────────────────────────────────────────────────

/// NUL-padded, truncated to `dst.len() - 1` bytes on a char boundary.
fn put_str(dst: &mut [u8], s: &str) {
    let max = dst.len().saturating_sub(1);
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    dst[..end].copy_from_slice(&s.as_bytes()[..end]);
    dst[end..].fill(0);
}

fn get_str(src: &[u8]) -> anyhow::Result<String> {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    Ok(std::str::from_utf8(&src[..end])?.to_string())
}

struct Fields<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> Fields<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    fn str(&mut self, s: &str, width: usize) {
        let start = self.out.len();
        self.out.resize(start + width, 0);
        put_str(&mut self.out[start..], s);
    }

    fn i32(&mut self, v: i32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], size: usize) -> anyhow::Result<Self> {
        if buf.len() != size {
            anyhow::bail!("row is {} bytes, expected {}", buf.len(), size);
        }
        Ok(Self { buf, pos: 0 })
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| anyhow::anyhow!("row truncated at byte {}", self.pos))?;
        self.pos += n;
        Ok(bytes)
    }

    fn str(&mut self, width: usize) -> anyhow::Result<String> {
        get_str(self.take(width)?)
    }

    fn i32(&mut self) -> anyhow::Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into()?))
    }

    fn i64(&mut self) -> anyhow::Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into()?))
    }

    fn u64(&mut self) -> anyhow::Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into()?))
    }

    fn f32(&mut self) -> anyhow::Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<R: Row>(row: &R) -> Vec<u8> {
        let mut out = Vec::new();
        row.encode(&mut out);
        out
    }

    #[test]
    fn row_sizes_match_declared_widths() {
        let io = IoTraceRow {
            operation: "MPI_File_write".into(),
            timestamp: 1,
            duration_us: 2,
            datatype: "MPI_INT".into(),
            offset: -1,
            count: 4,
            size: 16,
            rank: 0,
        };
        assert_eq!(encoded(&io).len(), IoTraceRow::SIZE);

        let eval = EvaluationRow {
            timestamp: 0,
            rank: 0,
            size: 0,
            metric: String::new(),
            predicted_codec: String::new(),
            predicted_level: 0,
            predicted_value: 0.0,
            predicted_size: 0,
            tested_codec: String::new(),
            tested_level: 0,
            tested_value: 0.0,
            tested_size: 0,
        };
        assert_eq!(encoded(&eval).len(), EvaluationRow::SIZE);
    }

    #[test]
    fn long_strings_are_truncated_to_width_minus_one() {
        let row = CompressionTraceRow {
            operation: "x".repeat(300),
            timestamp: 0,
            chunk: "é".repeat(60), // 120 bytes, two-byte chars
            duration_us: 0,
            datatype: "NA".into(),
            offset: 0,
            count: 0,
            size: 0,
            rank: 0,
            codec: "ZSTD".into(),
            level: 22,
            metric: "Compression Rate".into(),
            value: 3.5,
        };
        let bytes = encoded(&row);
        assert_eq!(bytes.len(), CompressionTraceRow::SIZE);

        let back = CompressionTraceRow::decode(&bytes).unwrap();
        assert_eq!(back.operation.len(), NAME_LEN - 1);
        assert_eq!(back.chunk, "é".repeat(49));
        assert_eq!(back.codec, "ZSTD");
        assert_eq!(back.value, 3.5);
    }

    #[test]
    fn layout_places_tables_back_to_back() {
        let layout = Layout::new([2, 3, 1]);
        let io = layout.entry(Table::IoTrace);
        let comp = layout.entry(Table::CompressionTrace);
        let eval = layout.entry(Table::Evaluation);
        assert_eq!(io.data_offset, HEADER_SIZE + 3 * TABLE_ENTRY_SIZE);
        assert_eq!(comp.data_offset, io.data_offset + 2 * IoTraceRow::SIZE as u64);
        assert_eq!(eval.data_offset, comp.data_offset + 3 * CompressionTraceRow::SIZE as u64);
        assert_eq!(layout.file_len(), eval.data_offset + EvaluationRow::SIZE as u64);
    }

    #[test]
    fn layout_bytes_parse_back_and_detect_corruption() {
        let layout = Layout::new([5, 0, 7]);
        let mut bytes = layout.to_bytes();
        assert_eq!(Layout::from_bytes(&bytes).unwrap(), layout);

        bytes[HEADER_SIZE as usize + 32] ^= 0xff; // IO-Trace record_count
        let err = Layout::from_bytes(&bytes).unwrap_err().to_string();
        assert!(err.contains("checksum mismatch"), "got: {err}");
    }
}
