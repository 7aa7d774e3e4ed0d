//! Memory-mapped register windows.
//!
//! This module maps physical register regions of the shim FPGA design into the
//! address space of the process and gives word-addressed access to them.

use std::os::unix::io::AsRawFd;
use std::path::Path;
use tokio::fs;

/// Word-addressed access to a register region.
///
/// Every call performs exactly one 32-bit access. Implementations must not
/// cache or batch accesses, since the hardware state behind the registers
/// (FIFO counters, for instance) changes asynchronously.
pub trait RegisterAccess: std::fmt::Debug + Send + Sync {
    /// Reads the word at `offset`.
    fn read(&self, offset: usize) -> u32;
    /// Writes `value` to the word at `offset`.
    fn write(&self, offset: usize, value: u32);
}

/// Failure to map a physical register region.
#[derive(thiserror::Error, Debug)]
#[error("cannot map {name} ({words} words at physical address {base_addr:#010x}) from {device}: {source}")]
pub struct MapError {
    /// Name of the region.
    pub name: String,
    /// Device used to map the region.
    pub device: String,
    /// Physical base address of the region.
    pub base_addr: usize,
    /// Size of the region in words.
    pub words: usize,
    /// Underlying OS error.
    #[source]
    pub source: std::io::Error,
}

/// Mapped register window.
///
/// This struct corresponds to a physical register region mapped with
/// `MAP_SHARED`. Dropping it unmaps the region.
#[derive(Debug)]
pub struct RegisterWindow {
    name: String,
    base_addr: usize,
    base: *mut libc::c_void,
    effective: *mut u32,
    map_size: usize,
    words: usize,
}

// The window is only accessed through volatile 32-bit reads and writes.
unsafe impl Send for RegisterWindow {}
unsafe impl Sync for RegisterWindow {}

impl RegisterWindow {
    /// Maps a register window.
    ///
    /// The window starts at physical address `base_addr` and contains `words`
    /// 32-bit registers. The mapping is established through `device`
    /// (normally `/dev/mem`), rounding the region out to whole pages.
    pub async fn map(
        device: impl AsRef<Path>,
        base_addr: usize,
        words: usize,
        name: &str,
    ) -> Result<RegisterWindow, MapError> {
        let device = device.as_ref();
        let map_error = |source| MapError {
            name: name.to_string(),
            device: device.display().to_string(),
            base_addr,
            words,
            source,
        };
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .await
            .map_err(map_error)?;
        let page = page_size::get();
        let page_base = base_addr & !(page - 1);
        let page_offset = base_addr - page_base;
        let map_size = (page_offset + words * std::mem::size_of::<u32>()).div_ceil(page) * page;
        let offset = libc::off_t::try_from(page_base).map_err(|_| {
            map_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "physical address does not fit in off_t",
            ))
        })?;

        let base = unsafe {
            match libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            ) {
                libc::MAP_FAILED => return Err(map_error(std::io::Error::last_os_error())),
                x => x,
            }
        };
        let effective = unsafe { base.byte_add(page_offset) } as *mut u32;
        tracing::debug!(
            name,
            base_addr = %format!("{base_addr:#010x}"),
            words,
            map_size,
            "mapped register window"
        );
        Ok(RegisterWindow {
            name: name.to_string(),
            base_addr,
            base,
            effective,
            map_size,
            words,
        })
    }

    /// Returns the name of the window.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the physical base address of the window.
    pub fn base_addr(&self) -> usize {
        self.base_addr
    }

    /// Returns the number of words in the window.
    pub fn words(&self) -> usize {
        self.words
    }
}

impl RegisterAccess for RegisterWindow {
    /// # Panics
    ///
    /// This function panics if `offset` is not smaller than the number of
    /// words in the window.
    fn read(&self, offset: usize) -> u32 {
        assert!(
            offset < self.words,
            "read past the end of register window {}",
            self.name
        );
        unsafe { std::ptr::read_volatile(self.effective.add(offset)) }
    }

    /// # Panics
    ///
    /// This function panics if `offset` is not smaller than the number of
    /// words in the window.
    fn write(&self, offset: usize, value: u32) {
        assert!(
            offset < self.words,
            "write past the end of register window {}",
            self.name
        );
        unsafe { std::ptr::write_volatile(self.effective.add(offset), value) }
    }
}

/// Unmaps the register window.
impl Drop for RegisterWindow {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.base, self.map_size) != 0 {
                tracing::error!(
                    name = %self.name,
                    "munmap failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn map_missing_device_is_recoverable() {
        let err = RegisterWindow::map("/nonexistent/mem", 0x4000_0000, 16, "sys-ctrl")
            .await
            .unwrap_err();
        assert_eq!(err.name, "sys-ctrl");
        assert_eq!(err.base_addr, 0x4000_0000);
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
        assert!(err.to_string().contains("0x40000000"));
    }

    #[tokio::test]
    async fn map_regular_file() {
        // A regular file can stand in for the memory device.
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(2 * page_size::get() as u64).unwrap();
        let window = RegisterWindow::map(file.path(), 8, 4, "test")
            .await
            .unwrap();
        window.write(0, 0xdead_beef);
        window.write(3, 0x1234_5678);
        assert_eq!(window.read(0), 0xdead_beef);
        assert_eq!(window.read(3), 0x1234_5678);
        assert_eq!(window.words(), 4);
        drop(window);
        let bytes = std::fs::read(file.path()).unwrap();
        assert_eq!(&bytes[8..12], &0xdead_beef_u32.to_ne_bytes());
    }

    #[tokio::test]
    #[should_panic]
    async fn read_out_of_range_panics() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(page_size::get() as u64).unwrap();
        let window = RegisterWindow::map(file.path(), 0, 4, "test")
            .await
            .unwrap();
        window.read(4);
    }
}
