//! Block device abstraction under the encrypted I/O queue.
//!
//! The queue and the conversion engine only need positioned reads and
//! writes of raw (possibly encrypted) bytes. Implementations must allow
//! concurrent callers: the device I/O stage, read-ahead and the conversion
//! engine all share one device.
//!
//! ## Implementations
//!
//! - [`FileDevice`]: disk image or raw device node opened as a file
//! - [`MemoryDevice`]: in-memory device with fault and latency injection,
//!   used by tests and benchmarks

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::config::DATA_UNIT_SIZE;
use crate::error::{QueueError, Result};

/// Positioned raw access to a storage device.
pub trait BlockDevice: Send + Sync {
    /// Reads into `buf` at `offset`. Returns the number of bytes read, which
    /// is only short at the end of the device.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `data` at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Flushes buffered writes to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Device size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Smallest addressable unit.
    fn sector_size(&self) -> usize {
        DATA_UNIT_SIZE
    }
}

/// Reads exactly `buf.len()` bytes, mapping a short read to [`QueueError::EndOfFile`].
pub fn read_exact_at(device: &dyn BlockDevice, offset: u64, buf: &mut [u8]) -> Result<()> {
    let read = device.read_at(offset, buf)?;
    if read != buf.len() {
        return Err(QueueError::EndOfFile(offset + read as u64));
    }
    Ok(())
}

fn read_full(device: &dyn BlockDevice, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let read = device.read_at(offset, buf)?;
    if read != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read at offset {}", offset + read as u64),
        ));
    }
    Ok(())
}

/// Overwrites every sector of `[offset, offset + length)` that cannot be read with zeros.
///
/// Returns the number of sectors zeroed. A failed zero write is returned as
/// an error.
pub fn zero_unreadable_sectors(
    device: &dyn BlockDevice,
    offset: u64,
    length: u64,
    sector_size: usize,
) -> io::Result<u64> {
    let mut sector = vec![0u8; sector_size];
    let zeros = vec![0u8; sector_size];
    let end = offset + length;
    let mut position = offset;
    let mut zeroed = 0;

    while position < end {
        if read_full(device, position, &mut sector).is_err() {
            device.write_at(position, &zeros)?;
            zeroed += 1;
        }
        position += sector_size as u64;
    }

    if zeroed > 0 {
        warn!("Zeroed {} unreadable sectors at offset {}", zeroed, offset);
    }
    Ok(zeroed)
}

/// Reads `buf.len()` bytes at `offset`, substituting zeros for unreadable sectors.
///
/// Returns the number of sectors that could not be read.
pub fn read_skipping_unreadable(
    device: &dyn BlockDevice,
    offset: u64,
    buf: &mut [u8],
    sector_size: usize,
) -> io::Result<u64> {
    if read_full(device, offset, buf).is_ok() {
        return Ok(0);
    }

    let mut bad_sectors = 0;
    for (i, chunk) in buf.chunks_mut(sector_size).enumerate() {
        let position = offset + (i * sector_size) as u64;
        if read_full(device, position, chunk).is_err() {
            chunk.fill(0);
            bad_sectors += 1;
        }
    }

    if bad_sectors > 0 {
        warn!("Skipped {} unreadable sectors at offset {}", bad_sectors, offset);
    }
    Ok(bad_sectors)
}

/// File-backed device
///
/// Works for disk images and for raw device nodes the process may open.
pub struct FileDevice {
    file: Mutex<File>,
    data_offset: u64,
    length: u64,
}

impl FileDevice {
    /// Opens an existing image read-write
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let length = file.metadata()?.len();
        Ok(Self::new(file, 0, length))
    }

    /// Creates (or truncates) an image of `length` bytes
    pub fn create(path: &Path, length: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(length)?;
        Ok(Self::new(file, 0, length))
    }

    /// Wraps an open file
    ///
    /// # Arguments
    /// * `file` - The file handle
    /// * `data_offset` - File offset of device offset 0
    /// * `length` - Device length exposed through [`BlockDevice::size`]
    pub fn new(file: File, data_offset: u64, length: u64) -> Self {
        Self {
            file: Mutex::new(file),
            data_offset,
            length,
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("device lock poisoned"))
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.length {
            return Ok(0);
        }
        let available = (self.length - offset).min(buf.len() as u64) as usize;

        let mut file = self.lock()?;
        file.seek(SeekFrom::Start(self.data_offset + offset))?;

        let mut total = 0;
        while total < available {
            match file.read(&mut buf[total..available]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let in_range = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.length);
        if !in_range {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("write of {} bytes at {} beyond device end", data.len(), offset),
            ));
        }

        let mut file = self.lock()?;
        file.seek(SeekFrom::Start(self.data_offset + offset))?;
        file.write_all(data)
    }

    fn flush(&self) -> io::Result<()> {
        let mut file = self.lock()?;
        file.flush()?;
        file.sync_data()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.length)
    }
}

/// In-memory device for testing
///
/// Supports injected read and write failures over byte ranges and a fixed
/// per-access latency.
pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    read_faults: Mutex<Vec<Range<u64>>>,
    write_faults: Mutex<Vec<Range<u64>>>,
    write_trap: Mutex<Option<u64>>,
    latency_us: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryDevice {
    /// Creates a zero-filled device of `size` bytes
    pub fn new(size: usize) -> Self {
        Self::from_data(vec![0u8; size])
    }

    /// Creates a device holding `data`
    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            read_faults: Mutex::new(Vec::new()),
            write_faults: Mutex::new(Vec::new()),
            write_trap: Mutex::new(None),
            latency_us: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Copy of the raw device content
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().map(|d| d.clone()).unwrap_or_default()
    }

    /// Copy of `length` raw bytes at `offset`
    pub fn raw(&self, offset: u64, length: usize) -> Vec<u8> {
        let offset = offset as usize;
        self.data
            .read()
            .map(|d| d[offset..offset + length].to_vec())
            .unwrap_or_default()
    }

    /// Overwrites raw bytes, bypassing injected faults
    pub fn write_raw(&self, offset: u64, bytes: &[u8]) {
        if let Ok(mut data) = self.data.write() {
            let offset = offset as usize;
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Fails every read overlapping `range`
    pub fn fail_reads(&self, range: Range<u64>) {
        if let Ok(mut faults) = self.read_faults.lock() {
            faults.push(range);
        }
    }

    /// Fails every write overlapping `range`
    pub fn fail_writes(&self, range: Range<u64>) {
        if let Ok(mut faults) = self.write_faults.lock() {
            faults.push(range);
        }
    }

    /// Lets `skip` writes succeed, then fails exactly one write
    pub fn fail_write_after(&self, skip: u64) {
        if let Ok(mut trap) = self.write_trap.lock() {
            *trap = Some(skip);
        }
    }

    /// Removes all injected faults
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.read_faults.lock() {
            faults.clear();
        }
        if let Ok(mut faults) = self.write_faults.lock() {
            faults.clear();
        }
        if let Ok(mut trap) = self.write_trap.lock() {
            *trap = None;
        }
    }

    fn trapped(&self) -> bool {
        let Ok(mut trap) = self.write_trap.lock() else {
            return false;
        };
        match trap.as_mut() {
            Some(0) => {
                *trap = None;
                true
            }
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }

    /// Delays every access by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    /// Number of reads served so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of writes served so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn faulted(faults: &Mutex<Vec<Range<u64>>>, offset: u64, length: usize) -> bool {
        let end = offset.saturating_add(length as u64);
        faults
            .lock()
            .map(|f| f.iter().any(|r| r.start < end && offset < r.end))
            .unwrap_or(false)
    }

    fn delay(&self) {
        let latency = self.latency_us.load(Ordering::SeqCst);
        if latency > 0 {
            thread::sleep(Duration::from_micros(latency));
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.delay();
        self.reads.fetch_add(1, Ordering::SeqCst);

        if Self::faulted(&self.read_faults, offset, buf.len()) {
            return Err(io::Error::other(format!("injected read failure at {}", offset)));
        }

        let data = self
            .data
            .read()
            .map_err(|_| io::Error::other("device lock poisoned"))?;
        let offset = match usize::try_from(offset) {
            Ok(offset) if offset < data.len() => offset,
            _ => return Ok(0),
        };
        let to_read = buf.len().min(data.len() - offset);
        buf[..to_read].copy_from_slice(&data[offset..offset + to_read]);
        Ok(to_read)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.delay();
        self.writes.fetch_add(1, Ordering::SeqCst);

        if Self::faulted(&self.write_faults, offset, bytes.len()) || self.trapped() {
            return Err(io::Error::other(format!("injected write failure at {}", offset)));
        }

        let mut data = self
            .data
            .write()
            .map_err(|_| io::Error::other("device lock poisoned"))?;
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(bytes.len())?))
            .filter(|range| range.end <= data.len());
        let Some(range) = range else {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("write of {} bytes at {} beyond device end", bytes.len(), offset),
            ));
        };

        // A rewritten sector reads back again, as after a drive remap
        let (start, end) = (range.start as u64, range.end as u64);
        data[range].copy_from_slice(bytes);
        if let Ok(mut faults) = self.read_faults.lock() {
            faults.retain(|r| !(start <= r.start && r.end <= end));
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        self.data
            .read()
            .map(|d| d.len() as u64)
            .map_err(|_| io::Error::other("device lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_memory_device_read_write() {
        let device = MemoryDevice::new(4096);
        device.write_at(512, &[0xAB; 512]).unwrap();

        let mut buf = vec![0u8; 1024];
        assert_eq!(device.read_at(0, &mut buf).unwrap(), 1024);
        assert!(buf[..512].iter().all(|&b| b == 0));
        assert!(buf[512..].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_memory_device_short_read() {
        let device = MemoryDevice::new(1024);
        let mut buf = vec![0u8; 1024];
        assert_eq!(device.read_at(512, &mut buf).unwrap(), 512);
        assert!(matches!(
            read_exact_at(&device, 512, &mut buf),
            Err(QueueError::EndOfFile(1024))
        ));
    }

    #[test]
    fn test_memory_device_write_past_end() {
        let device = MemoryDevice::new(1024);
        assert!(device.write_at(1024, &[0u8; 512]).is_err());
    }

    #[test]
    fn test_memory_device_offset_overflow() {
        let device = MemoryDevice::new(1024);
        let err = device.write_at(u64::MAX - 511, &[0u8; 1024]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);

        let mut buf = [0u8; 512];
        assert_eq!(device.read_at(u64::MAX - 511, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_injected_faults() {
        let device = MemoryDevice::new(4096);
        device.fail_reads(1024..1536);
        device.fail_writes(2048..2049);

        let mut buf = vec![0u8; 512];
        assert!(device.read_at(512, &mut buf).is_ok());
        assert!(device.read_at(1024, &mut buf).is_err());
        assert!(device.write_at(1536, &[1u8; 1024]).is_err());

        device.clear_faults();
        assert!(device.read_at(1024, &mut buf).is_ok());
        assert!(device.write_at(1536, &[1u8; 1024]).is_ok());
    }

    #[test]
    fn test_write_trap() {
        let device = MemoryDevice::new(4096);
        device.fail_write_after(1);
        assert!(device.write_at(0, &[1u8; 512]).is_ok());
        assert!(device.write_at(0, &[2u8; 512]).is_err());
        assert!(device.write_at(0, &[3u8; 512]).is_ok());
        assert_eq!(device.raw(0, 1), vec![3]);
    }

    #[test]
    fn test_zero_unreadable_sectors() {
        let device = MemoryDevice::from_data(vec![0x55u8; 4096]);
        device.fail_reads(1024..1536);

        let zeroed = zero_unreadable_sectors(&device, 0, 4096, 512).unwrap();
        assert_eq!(zeroed, 1);

        assert!(read_exact_at(&device, 0, &mut [0u8; 4096]).is_ok());
        assert!(device.raw(1024, 512).iter().all(|&b| b == 0));
        assert!(device.raw(512, 512).iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_read_skipping_unreadable() {
        let device = MemoryDevice::from_data(vec![0x55u8; 4096]);
        device.fail_reads(512..1024);
        device.fail_reads(3072..3073);

        let mut buf = vec![0xFFu8; 4096];
        let bad = read_skipping_unreadable(&device, 0, &mut buf, 512).unwrap();
        assert_eq!(bad, 2);
        assert!(buf[512..1024].iter().all(|&b| b == 0));
        assert!(buf[3072..3584].iter().all(|&b| b == 0));
        assert!(buf[..512].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_file_device() {
        let temp = NamedTempFile::new().unwrap();
        let device = FileDevice::create(temp.path(), 8192).unwrap();
        assert_eq!(device.size().unwrap(), 8192);

        device.write_at(4096, &[0x42; 1024]).unwrap();
        device.flush().unwrap();

        let reopened = FileDevice::open(temp.path()).unwrap();
        let mut buf = vec![0u8; 1024];
        assert_eq!(reopened.read_at(4096, &mut buf).unwrap(), 1024);
        assert!(buf.iter().all(|&b| b == 0x42));

        assert!(reopened.write_at(8000, &[0u8; 512]).is_err());
        assert_eq!(reopened.read_at(8192, &mut buf).unwrap(), 0);
    }
}
