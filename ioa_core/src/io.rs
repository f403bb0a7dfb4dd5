//! The parallel I/O middleware seen from the write path.
//!
//! [`IoLayer`] is the operation set the interceptor wraps. The interceptor
//! implements it too, so application code is written against the trait and
//! the interception can be switched on without touching call sites.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Opaque identity of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// Element type of a write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datatype {
    /// Empty for anonymous derived types.
    pub name: &'static str,
    pub size: usize,
}

impl Datatype {
    pub const BYTE: Datatype = Datatype { name: "MPI_BYTE", size: 1 };
    pub const CHAR: Datatype = Datatype { name: "MPI_CHAR", size: 1 };
    pub const INT: Datatype = Datatype { name: "MPI_INT", size: 4 };
    pub const FLOAT: Datatype = Datatype { name: "MPI_FLOAT", size: 4 };
    pub const DOUBLE: Datatype = Datatype { name: "MPI_DOUBLE", size: 8 };

    pub const fn unnamed(size: usize) -> Self {
        Self { name: "", size }
    }

    /// Name as recorded in traces, `NA` when the type has none.
    pub fn display_name(&self) -> &'static str {
        if self.name.is_empty() {
            "NA"
        } else {
            self.name
        }
    }
}

/// The write-family entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Write,
    WriteAll,
    WriteAt,
    WriteAtAll,
    IWrite,
    IWriteAll,
    IWriteAt,
    IWriteAtAll,
}

impl WriteOp {
    pub const ALL: [WriteOp; 8] = [
        WriteOp::Write,
        WriteOp::WriteAll,
        WriteOp::WriteAt,
        WriteOp::WriteAtAll,
        WriteOp::IWrite,
        WriteOp::IWriteAll,
        WriteOp::IWriteAt,
        WriteOp::IWriteAtAll,
    ];

    /// Operation name stored in trace records.
    pub fn name(self) -> &'static str {
        match self {
            WriteOp::Write => "MPI_File_write",
            WriteOp::WriteAll => "MPI_File_write_all",
            WriteOp::WriteAt => "MPI_File_write_at",
            WriteOp::WriteAtAll => "MPI_File_write_at_all",
            WriteOp::IWrite => "MPI_File_iwrite",
            WriteOp::IWriteAll => "MPI_File_iwrite_all",
            WriteOp::IWriteAt => "MPI_File_iwrite_at",
            WriteOp::IWriteAtAll => "MPI_File_iwrite_at_all",
        }
    }

    pub fn has_explicit_offset(self) -> bool {
        matches!(
            self,
            WriteOp::WriteAt | WriteOp::WriteAtAll | WriteOp::IWriteAt | WriteOp::IWriteAtAll
        )
    }

    pub fn is_collective(self) -> bool {
        matches!(
            self,
            WriteOp::WriteAll | WriteOp::WriteAtAll | WriteOp::IWriteAll | WriteOp::IWriteAtAll
        )
    }

    pub fn is_nonblocking(self) -> bool {
        matches!(
            self,
            WriteOp::IWrite | WriteOp::IWriteAll | WriteOp::IWriteAt | WriteOp::IWriteAtAll
        )
    }
}

/// Arguments of one write-family call, passed through unchanged.
#[derive(Debug, Clone, Copy)]
pub struct WriteCall<'a> {
    pub op: WriteOp,
    pub handle: FileHandle,
    /// Explicit file offset for the `*_at` variants.
    pub offset: Option<i64>,
    pub buf: &'a [u8],
    pub count: i32,
    pub datatype: Datatype,
}

impl<'a> WriteCall<'a> {
    pub fn new(
        op: WriteOp,
        handle: FileHandle,
        buf: &'a [u8],
        count: i32,
        datatype: Datatype,
    ) -> Self {
        Self {
            op,
            handle,
            offset: None,
            buf,
            count,
            datatype,
        }
    }

    pub fn at(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// `count × datatype size`.
    pub fn byte_size(&self) -> usize {
        usize::try_from(self.count).unwrap_or(0) * self.datatype.size
    }

    /// The bytes this call actually writes.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[..self.byte_size().min(self.buf.len())]
    }
}

/// Operation set of the underlying parallel I/O middleware.
pub trait IoLayer {
    /// Completion of a write: a status for blocking calls, a request for
    /// non-blocking ones.
    type Completion;
    type Error;

    fn open(&mut self, path: &str) -> Result<FileHandle, Self::Error>;

    fn write(&mut self, call: &WriteCall<'_>) -> Result<Self::Completion, Self::Error>;

    /// Current individual file pointer of `handle`.
    fn position(&mut self, handle: FileHandle) -> i64;

    fn finalize(&mut self) -> Result<(), Self::Error>;
}

/// Local-filesystem layer: one `File` per handle, non-blocking calls
/// complete eagerly.
#[derive(Debug, Default)]
pub struct LocalFiles {
    files: HashMap<FileHandle, File>,
    next: u64,
    root: Option<PathBuf>,
}

impl LocalFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    fn file(&mut self, handle: FileHandle) -> io::Result<&mut File> {
        self.files.get_mut(&handle).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown file handle {}", handle.0),
            )
        })
    }
}

impl IoLayer for LocalFiles {
    /// Bytes written.
    type Completion = usize;
    type Error = io::Error;

    fn open(&mut self, path: &str) -> io::Result<FileHandle> {
        let path = match &self.root {
            Some(root) => root.join(path),
            None => PathBuf::from(path),
        };
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        self.next += 1;
        let handle = FileHandle(self.next);
        self.files.insert(handle, file);
        Ok(handle)
    }

    fn write(&mut self, call: &WriteCall<'_>) -> io::Result<usize> {
        let payload = call.payload();
        let file = self.file(call.handle)?;
        match call.offset {
            // explicit-offset writes leave the individual file pointer alone
            Some(offset) => {
                let offset = u64::try_from(offset).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "negative file offset")
                })?;
                let pointer = file.stream_position()?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(payload)?;
                file.seek(SeekFrom::Start(pointer))?;
            }
            None => file.write_all(payload)?,
        }
        Ok(payload.len())
    }

    fn position(&mut self, handle: FileHandle) -> i64 {
        self.file(handle)
            .and_then(|f| f.stream_position())
            .map(|p| p as i64)
            .unwrap_or(0)
    }

    fn finalize(&mut self) -> io::Result<()> {
        for (_, file) in self.files.drain() {
            file.sync_all()?;
        }
        Ok(())
    }
}
