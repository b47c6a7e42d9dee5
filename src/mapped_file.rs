use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

// A regular file mapped MAP_SHARED, so every process that maps the same path
// sees the same bytes through the page cache. Accessors copy through the raw
// pointer rather than handing out references, other processes may be writing
// underneath us at any time.
pub struct MappedFile {
    file: File,
    path: PathBuf,
    addr: *mut u8,
    n_bytes: usize,
    writable: bool,
}

// the mapping is owned exclusively by this struct, access is serialized by
// whoever owns it (the queue keeps it behind a Mutex)
unsafe impl Send for MappedFile {}

fn map(file: &File, n_bytes: usize, writable: bool) -> io::Result<*mut u8> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            n_bytes,
            prot,
            libc::MAP_SHARED, // other processes must see our writes
            file.as_raw_fd(),
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    return Ok(addr as *mut u8);
}

impl MappedFile {
    /// Create the file at `path` if needed, resize it in place to `n_bytes`
    /// and map it read-write. Bytes kept from an existing file are not
    /// cleared.
    pub fn create(path: &Path, n_bytes: usize) -> io::Result<MappedFile> {
        return MappedFile::create_with(path, n_bytes, false);
    }

    /// As `create`, but the exclusive advisory lock is taken before the
    /// file is resized and is still held on return.
    pub fn create_locked(path: &Path, n_bytes: usize) -> io::Result<MappedFile> {
        return MappedFile::create_with(path, n_bytes, true);
    }

    fn create_with(path: &Path, n_bytes: usize, lock: bool) -> io::Result<MappedFile> {
        if n_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        // never truncated to zero, other processes may have it mapped
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if lock {
            flock(&file, libc::LOCK_EX)?;
        }
        file.set_len(n_bytes as u64)?;

        let addr = map(&file, n_bytes, true)?;
        return Ok(MappedFile {
            file,
            path: path.to_path_buf(),
            addr,
            n_bytes,
            writable: true,
        });
    }

    /// Map an existing file at its current length.
    pub fn open(path: &Path, writable: bool) -> io::Result<MappedFile> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let n_bytes = file.metadata()?.len() as usize;
        if n_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is empty", path.display()),
            ));
        }

        let addr = map(&file, n_bytes, writable)?;
        return Ok(MappedFile {
            file,
            path: path.to_path_buf(),
            addr,
            n_bytes,
            writable,
        });
    }

    pub fn len(&self) -> usize {
        return self.n_bytes;
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    pub fn is_writable(&self) -> bool {
        return self.writable;
    }

    pub fn read_into(&self, start: usize, out: &mut [u8]) {
        assert!(start + out.len() <= self.n_bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.add(start), out.as_mut_ptr(), out.len());
        }
    }

    pub fn write_from(&mut self, start: usize, data: &[u8]) {
        assert!(self.writable, "write to read-only mapping");
        assert!(start + data.len() <= self.n_bytes);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr.add(start), data.len());
        }
    }

    /// Flush dirty pages to disk (msync, synchronous).
    pub fn flush(&self) -> io::Result<()> {
        if !self.writable {
            return Ok(());
        }
        let ret = unsafe {
            libc::msync(self.addr as *mut libc::c_void, self.n_bytes, libc::MS_SYNC)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }

    /// The file at `path` is no longer the one mapped here, or its length
    /// has changed since it was mapped.
    pub fn is_stale(&self) -> io::Result<bool> {
        let on_disk = std::fs::metadata(&self.path)?;
        let mapped = self.file.metadata()?;
        return Ok(on_disk.dev() != mapped.dev()
            || on_disk.ino() != mapped.ino()
            || on_disk.len() != self.n_bytes as u64);
    }

    /// Take the exclusive advisory lock on the underlying file, blocking until
    /// it is available. Released by `unlock` or when the file is closed.
    pub fn lock_exclusive(&self) -> io::Result<()> {
        return flock(&self.file, libc::LOCK_EX);
    }

    pub fn unlock(&self) -> io::Result<()> {
        return flock(&self.file, libc::LOCK_UN);
    }
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.n_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped");

        let mut writer = MappedFile::create(&path, 64).expect("create");
        assert_eq!(writer.len(), 64);
        writer.write_from(0, &[1, 2, 3, 4]);
        writer.write_from(63, &[7]);

        // a second mapping of the same file sees the writes immediately
        let reader = MappedFile::open(&path, false).expect("open");
        assert_eq!(reader.len(), 64);
        let mut raw = [0u8; 4];
        reader.read_into(0, &mut raw);
        assert_eq!(raw, [1, 2, 3, 4]);
        let mut last = [0u8; 1];
        reader.read_into(63, &mut last);
        assert_eq!(last, [7]);
        assert!(!reader.is_writable());

        writer.flush().expect("flush");
        drop(writer);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn empty_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        assert!(MappedFile::create(&path, 0).is_err());
        std::fs::write(&path, b"").unwrap();
        assert!(MappedFile::open(&path, false).is_err());
    }

    #[test]
    fn lock_and_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        let file = MappedFile::create(&path, 16).unwrap();
        file.lock_exclusive().expect("lock");
        file.unlock().expect("unlock");
        file.lock_exclusive().expect("relock");
    }

    #[test]
    fn create_resizes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resized");
        let mut first = MappedFile::create(&path, 32).unwrap();
        first.write_from(0, &[9, 9]);

        let second = MappedFile::create_locked(&path, 64).unwrap();
        second.unlock().unwrap();
        assert_eq!(second.len(), 64);
        let mut kept = [0u8; 2];
        second.read_into(0, &mut kept);
        assert_eq!(kept, [9, 9]);
    }

    #[test]
    fn resized_or_replaced_files_are_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched");
        let mapped = MappedFile::create(&path, 32).unwrap();
        assert!(!mapped.is_stale().unwrap());

        let _grown = MappedFile::create(&path, 48).unwrap();
        assert!(mapped.is_stale().unwrap());

        let current = MappedFile::open(&path, false).unwrap();
        assert!(!current.is_stale().unwrap());
        std::fs::remove_file(&path).unwrap();
        let _replacement = MappedFile::create(&path, 48).unwrap();
        assert!(current.is_stale().unwrap());
    }
}
