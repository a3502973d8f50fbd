//! GNU ustar archive reading and writing
//!
//! The packaged sysroot is a plain GNU tar: 512-byte header records, each
//! followed by the file body padded to the next record. Only regular files and
//! directories appear in it; any other entry type is rejected.

use thiserror::Error;

/// Size of a header record and the alignment of file bodies
pub const BLOCK_SIZE: usize = 512;

/// Magic plus version as GNU tar writes them, read up to the first NUL
const MAGIC: &str = "ustar  ";

/// Errors raised while reading an archive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveError {
    /// Entry type other than regular file or directory
    #[error("unsupported tar entry type '{tag}' for {name}")]
    UnsupportedEntryType { name: String, tag: char },

    /// File body runs past the end of the buffer
    #[error("tar entry {name} is truncated: needs {needed} bytes, {available} available")]
    Truncated {
        name: String,
        needed: usize,
        available: usize,
    },
}

/// What an entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn tag(self) -> u8 {
        match self {
            EntryKind::File => b'0',
            EntryKind::Directory => b'5',
        }
    }
}

/// One decoded header, borrowing its body from the archive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry<'a> {
    pub name: String,
    pub mode: u64,
    pub owner: u64,
    pub group: u64,
    pub size: u64,
    pub mtime: u64,
    pub checksum: u64,
    pub kind: EntryKind,
    pub linkname: String,
    pub owner_name: String,
    pub group_name: String,
    pub dev_major: String,
    pub dev_minor: String,
    pub prefix: String,
    pub contents: Option<&'a [u8]>,
}

/// Lazy reader over an archive held in memory
pub struct Archive<'a> {
    data: &'a [u8],
    offset: usize,
    finished: bool,
}

impl<'a> Archive<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            finished: false,
        }
    }

    /// Hand every entry to `f`; returns how many entries were seen
    pub fn unpack<E, F>(self, mut f: F) -> Result<usize, E>
    where
        E: From<ArchiveError>,
        F: FnMut(ArchiveEntry<'a>) -> Result<(), E>,
    {
        let mut count = 0;
        for entry in self {
            f(entry?)?;
            count += 1;
        }
        Ok(count)
    }

    fn field(&mut self, len: usize) -> &'a [u8] {
        let data = self.data;
        let field = &data[self.offset..self.offset + len];
        self.offset += len;
        field
    }

    fn text(&mut self, len: usize) -> String {
        read_str(self.field(len))
    }

    fn octal(&mut self, len: usize) -> u64 {
        parse_octal(self.field(len))
    }

    fn align_up(&mut self) {
        self.offset = align_up(self.offset);
    }

    fn read_entry(&mut self) -> Option<Result<ArchiveEntry<'a>, ArchiveError>> {
        if self.offset + BLOCK_SIZE > self.data.len() {
            return None;
        }
        let start = self.offset;

        let name = self.text(100);
        let mode = self.octal(8);
        let owner = self.octal(8);
        let group = self.octal(8);
        let size = self.octal(12);
        let mtime = self.octal(12);
        let checksum = self.octal(8);
        let tag = self.field(1)[0];
        let linkname = self.text(100);

        if self.text(8) != MAGIC {
            // zero blocks at the end of the archive land here
            self.offset = start;
            return None;
        }

        let owner_name = self.text(32);
        let group_name = self.text(32);
        let dev_major = self.text(8);
        let dev_minor = self.text(8);
        let prefix = self.text(155);
        self.align_up();

        let (kind, contents) = match tag {
            b'0' => {
                let available = self.data.len() - self.offset;
                if size as usize > available {
                    return Some(Err(ArchiveError::Truncated {
                        name,
                        needed: size as usize,
                        available,
                    }));
                }
                let body = &self.data[self.offset..self.offset + size as usize];
                self.offset += size as usize;
                self.align_up();
                (EntryKind::File, Some(body))
            }
            b'5' => (EntryKind::Directory, None),
            other => {
                return Some(Err(ArchiveError::UnsupportedEntryType {
                    name,
                    tag: other as char,
                }));
            }
        };

        Some(Ok(ArchiveEntry {
            name,
            mode,
            owner,
            group,
            size,
            mtime,
            checksum,
            kind,
            linkname,
            owner_name,
            group_name,
            dev_major,
            dev_minor,
            prefix,
            contents,
        }))
    }
}

impl<'a> Iterator for Archive<'a> {
    type Item = Result<ArchiveEntry<'a>, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = self.read_entry();
        if !matches!(item, Some(Ok(_))) {
            self.finished = true;
        }
        item
    }
}

/// Builds archives in the layout [`Archive`] reads
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    buf: Vec<u8>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_dir(&mut self, name: &str) -> &mut Self {
        self.header(name, EntryKind::Directory, 0o755, 0);
        self
    }

    pub fn append_file(&mut self, name: &str, contents: &[u8]) -> &mut Self {
        self.header(name, EntryKind::File, 0o644, contents.len() as u64);
        self.buf.extend_from_slice(contents);
        self.buf.resize(align_up(self.buf.len()), 0);
        self
    }

    /// Terminate with two zero records and return the bytes
    pub fn finish(&mut self) -> Vec<u8> {
        self.buf.resize(self.buf.len() + 2 * BLOCK_SIZE, 0);
        std::mem::take(&mut self.buf)
    }

    fn header(&mut self, name: &str, kind: EntryKind, mode: u64, size: u64) {
        let mut block = [0u8; BLOCK_SIZE];
        put_str(&mut block[0..100], name);
        put_octal(&mut block[100..108], mode);
        put_octal(&mut block[108..116], 0);
        put_octal(&mut block[116..124], 0);
        put_octal(&mut block[124..136], size);
        put_octal(&mut block[136..148], 0);
        block[156] = kind.tag();
        block[257..265].copy_from_slice(b"ustar  \0");
        put_str(&mut block[265..297], "root");
        put_str(&mut block[297..329], "root");

        // checksum is computed with its own field read as spaces
        block[148..156].fill(b' ');
        let sum: u64 = block.iter().map(|&b| b as u64).sum();
        let digits = format!("{:06o}\0 ", sum);
        block[148..156].copy_from_slice(digits.as_bytes());

        self.buf.extend_from_slice(&block);
    }
}

fn align_up(offset: usize) -> usize {
    (offset + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
}

fn read_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Leading octal digits after optional spaces; empty reads as zero
fn parse_octal(field: &[u8]) -> u64 {
    field
        .iter()
        .skip_while(|&&b| b == b' ')
        .take_while(|b| (b'0'..=b'7').contains(b))
        .fold(0u64, |acc, &b| (acc << 3) | (b - b'0') as u64)
}

fn put_str(field: &mut [u8], s: &str) {
    let len = s.len().min(field.len());
    field[..len].copy_from_slice(&s.as_bytes()[..len]);
}

fn put_octal(field: &mut [u8], value: u64) {
    let digits = format!("{:0width$o}", value, width = field.len() - 1);
    put_str(field, &digits);
}
