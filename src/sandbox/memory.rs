//! Byte access into a module's linear memory
//!
//! A [`ByteAccessor`] borrows the memory for the length of one host operation.
//! It is never kept across a guest call: growth inside the guest can move the
//! buffer, so every syscall re-acquires its accessor from the memory handle.
//! Word accesses must be 4-byte aligned. Out-of-range and misaligned accesses
//! are faults, never clamped.

use super::abi::exports;
use super::error::{SandboxError, SandboxResult, Signal};
use bytemuck::{Pod, Zeroable};
use wasmi::{Caller, Extern, Memory};

/// One `ciovec`/`iovec` record as laid out by wasm32 WASI
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct IoVec {
    pub buf: u32,
    pub len: u32,
}

impl IoVec {
    pub const SIZE: u32 = std::mem::size_of::<IoVec>() as u32;
}

/// Typed view over linear memory bytes
pub struct ByteAccessor<'m> {
    bytes: &'m mut [u8],
}

impl<'m> ByteAccessor<'m> {
    pub fn new(bytes: &'m mut [u8]) -> Self {
        Self { bytes }
    }

    /// Re-acquire an accessor over a guest memory
    pub fn of<T: 'm>(memory: &Memory, store: impl Into<wasmi::StoreContextMut<'m, T>>) -> Self {
        Self::new(memory.data_mut(store))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn range(&self, address: u32, size: u32) -> SandboxResult<std::ops::Range<usize>> {
        let start = address as usize;
        let end = start + size as usize;
        if end > self.bytes.len() {
            return Err(SandboxError::MemoryAccessOutOfBounds {
                address,
                size,
                memory_size: self.bytes.len() as u32,
            });
        }
        Ok(start..end)
    }

    fn aligned(address: u32, width: u32) -> SandboxResult<()> {
        if address % 4 != 0 {
            return Err(SandboxError::Misaligned { address, width });
        }
        Ok(())
    }

    pub fn read_u8(&self, address: u32) -> SandboxResult<u8> {
        let range = self.range(address, 1)?;
        Ok(self.bytes[range.start])
    }

    pub fn write_u8(&mut self, address: u32, value: u8) -> SandboxResult<()> {
        let range = self.range(address, 1)?;
        self.bytes[range.start] = value;
        Ok(())
    }

    pub fn read_u32(&self, address: u32) -> SandboxResult<u32> {
        Self::aligned(address, 32)?;
        let range = self.range(address, 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[range]);
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> SandboxResult<()> {
        Self::aligned(address, 32)?;
        let range = self.range(address, 4)?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a 64-bit value as its low and high 32-bit halves
    pub fn write_u64(&mut self, address: u32, low: u32, high: u32) -> SandboxResult<()> {
        Self::aligned(address, 64)?;
        self.range(address, 8)?;
        self.write_u32(address, low)?;
        self.write_u32(address + 4, high)
    }

    pub fn read_bytes(&self, address: u32, size: u32) -> SandboxResult<&[u8]> {
        let range = self.range(address, size)?;
        Ok(&self.bytes[range])
    }

    pub fn bytes_mut(&mut self, address: u32, size: u32) -> SandboxResult<&mut [u8]> {
        let range = self.range(address, size)?;
        Ok(&mut self.bytes[range])
    }

    /// Copy `data` to `address`; returns the number of bytes written
    pub fn write_bytes(&mut self, address: u32, data: &[u8]) -> SandboxResult<u32> {
        let range = self.range(address, data.len() as u32)?;
        self.bytes[range].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    /// Write a NUL-terminated string; returns bytes written including the NUL
    pub fn write_cstr(&mut self, address: u32, s: &str) -> SandboxResult<u32> {
        let written = self.write_bytes(address, s.as_bytes())?;
        self.write_u8(address + written, 0)?;
        Ok(written + 1)
    }

    /// Read at most `len` bytes, stopping early at a NUL
    pub fn read_str(&self, address: u32, len: u32) -> SandboxResult<String> {
        let bytes = self.read_bytes(address, len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Decode `count` iovec records starting at `address`
    pub fn iovecs(&self, address: u32, count: u32) -> SandboxResult<Vec<IoVec>> {
        Self::aligned(address, 32)?;
        let bytes = self.read_bytes(address, count.saturating_mul(IoVec::SIZE))?;
        Ok(bytes
            .chunks_exact(IoVec::SIZE as usize)
            .map(|chunk| {
                let raw: IoVec = bytemuck::pod_read_unaligned(chunk);
                IoVec {
                    buf: u32::from_le(raw.buf),
                    len: u32::from_le(raw.len),
                }
            })
            .collect())
    }

    /// Concatenate the bytes referenced by a list of iovecs
    pub fn gather(&self, iovecs: &[IoVec]) -> SandboxResult<Vec<u8>> {
        let mut out = Vec::new();
        for iov in iovecs {
            out.extend_from_slice(self.read_bytes(iov.buf, iov.len)?);
        }
        Ok(out)
    }

    /// Fill iovecs in order from `data`; returns the number of bytes placed
    pub fn scatter(&mut self, iovecs: &[IoVec], data: &[u8]) -> SandboxResult<usize> {
        let mut placed = 0;
        for iov in iovecs {
            let take = (iov.len as usize).min(data.len() - placed);
            if take == 0 {
                break;
            }
            self.write_bytes(iov.buf, &data[placed..placed + take])?;
            placed += take;
            if take != iov.len as usize {
                break;
            }
        }
        Ok(placed)
    }
}

/// The calling module's exported linear memory
pub fn exported_memory<T>(caller: &Caller<'_, T>) -> Result<Memory, Signal> {
    caller
        .get_export(exports::MEMORY)
        .and_then(Extern::into_memory)
        .ok_or_else(|| Signal::fault("module exports no linear memory"))
}
