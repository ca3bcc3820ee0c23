use std::ptr::NonNull;

#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

#[cfg(unix)]
use tracing::{debug, info};

use crate::error::{RegionError, Result};

/// Prefix applied to every region object name.
const NAME_PREFIX: &str = "/eshm_";

/// Maximum length of the platform object name, prefix included.
/// macOS limits POSIX shm names to `PSHMNAMLEN` (31); Linux to `NAME_MAX`.
#[cfg(target_os = "macos")]
pub const MAX_NAME_LEN: usize = 31;
#[cfg(not(target_os = "macos"))]
pub const MAX_NAME_LEN: usize = 255;

/// Map a caller-supplied region name onto the platform object name.
///
/// `name` becomes `/eshm_{name}` with every `/` replaced by `_`, so callers
/// may use path-like identifiers without creating nested objects.
pub fn os_name(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(RegionError::InvalidName(name.to_string()));
    }
    let os = format!("{NAME_PREFIX}{}", name.replace('/', "_"));
    if os.len() > MAX_NAME_LEN {
        return Err(RegionError::NameTooLong {
            name: name.to_string(),
            len: os.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(os)
}

/// Identity of the object backing a region (device + inode).
///
/// Two attaches that report different identities are looking at different
/// regions even when the name is the same, e.g. after the creator unlinked
/// and re-created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionIdentity {
    pub dev: u64,
    pub ino: u64,
}

/// A named block of memory mapped read/write and shared with other processes.
///
/// The mapping is released on drop. The name is only removed by an explicit
/// [`SharedRegion::unlink`]; whether to do that is the owner's policy.
pub struct SharedRegion {
    name: String,
    os_name: String,
    ptr: NonNull<u8>,
    len: usize,
    identity: RegionIdentity,
    created: bool,
    mapped: bool,
}

// SAFETY: the region is plain shared memory. All cross-thread and
// cross-process access goes through atomics or the region lock.
unsafe impl Send for SharedRegion {}
// SAFETY: see above; `SharedRegion` itself exposes only a raw pointer.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Default permission mode for created regions.
    pub const DEFAULT_MODE: u32 = 0o600;

    /// Caller-supplied region name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Platform object name (`/eshm_...`).
    pub fn os_name(&self) -> &str {
        &self.os_name
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping. Page aligned.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn identity(&self) -> RegionIdentity {
        self.identity
    }

    /// Whether this handle created the region (as opposed to attaching).
    pub fn created(&self) -> bool {
        self.created
    }
}

#[cfg(unix)]
impl SharedRegion {
    /// Create a new region of `len` zero-filled bytes.
    ///
    /// Fails with an `AlreadyExists` create error if the name is taken; see
    /// [`RegionError::is_already_exists`].
    pub fn create(name: &str, len: usize) -> Result<Self> {
        Self::create_with_mode(name, len, Self::DEFAULT_MODE)
    }

    /// Create a new region with an explicit permission mode.
    pub fn create_with_mode(name: &str, len: usize, mode: u32) -> Result<Self> {
        let os = os_name(name)?;
        let c_name = c_string(&os)?;
        let create_err = |source: io::Error| RegionError::Create {
            name: os.clone(),
            source,
        };

        if len == 0 {
            return Err(create_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region length must be non-zero",
            )));
        }

        // SAFETY: `c_name` is a valid NUL-terminated string for the call.
        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                mode as libc::c_uint,
            )
        };
        if raw < 0 {
            return Err(create_err(io::Error::last_os_error()));
        }
        // SAFETY: `raw` was just returned by shm_open and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let sized = (|| {
            // SAFETY: fd is a valid open descriptor; fchmod pins the mode
            // regardless of the process umask.
            if unsafe { libc::fchmod(fd.as_raw_fd(), mode as libc::mode_t) } != 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fd is a valid shm descriptor opened read/write.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let ptr = map(&fd, len)?;
            let identity = match identity_of_fd(&fd) {
                Ok(identity) => identity,
                Err(err) => {
                    unmap(ptr, len);
                    return Err(err);
                }
            };
            Ok((ptr, identity))
        })();

        let (ptr, identity) = match sized {
            Ok(mapped) => mapped,
            Err(err) => {
                // SAFETY: `c_name` is valid; we created this object above.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(create_err(err));
            }
        };

        info!(name = %os, len, "created shared region");

        Ok(Self {
            name: name.to_string(),
            os_name: os,
            ptr,
            len,
            identity,
            created: true,
            mapped: true,
        })
    }

    /// Attach to an existing region, requiring at least `min_len` bytes.
    pub fn open(name: &str, min_len: usize) -> Result<Self> {
        let os = os_name(name)?;
        let c_name = c_string(&os)?;
        let attach_err = |source: io::Error| RegionError::Attach {
            name: os.clone(),
            source,
        };

        // SAFETY: `c_name` is a valid NUL-terminated string for the call.
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if raw < 0 {
            return Err(attach_err(io::Error::last_os_error()));
        }
        // SAFETY: `raw` was just returned by shm_open and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let st = fstat(&fd).map_err(attach_err)?;
        let size = usize::try_from(st.st_size).unwrap_or(0);
        if size < min_len {
            return Err(RegionError::TooSmall {
                name: os.clone(),
                size,
                required: min_len,
            });
        }

        let ptr = map(&fd, size).map_err(attach_err)?;
        let identity = identity_from_stat(&st);

        debug!(name = %os, len = size, ?identity, "attached shared region");

        Ok(Self {
            name: name.to_string(),
            os_name: os,
            ptr,
            len: size,
            identity,
            created: false,
            mapped: true,
        })
    }

    /// Remove the region name. Existing mappings stay valid until dropped.
    ///
    /// Returns `Ok(false)` if no region existed under the name.
    pub fn unlink(name: &str) -> Result<bool> {
        let os = os_name(name)?;
        let c_name = c_string(&os)?;
        // SAFETY: `c_name` is a valid NUL-terminated string for the call.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            debug!(name = %os, "unlinked shared region");
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            return Ok(false);
        }
        Err(RegionError::Destroy {
            name: os,
            source: err,
        })
    }

    /// Identity of the object currently registered under `name`, if any.
    ///
    /// Does not map the region.
    pub fn identity_of(name: &str) -> Result<Option<RegionIdentity>> {
        let os = os_name(name)?;
        let c_name = c_string(&os)?;
        // SAFETY: `c_name` is a valid NUL-terminated string for the call.
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0 as libc::c_uint) };
        if raw < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Ok(None);
            }
            return Err(RegionError::Attach {
                name: os,
                source: err,
            });
        }
        // SAFETY: `raw` was just returned by shm_open and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        identity_of_fd(&fd)
            .map(Some)
            .map_err(|source| RegionError::Attach { name: os, source })
    }

    /// Whether a region exists under `name`.
    pub fn exists(name: &str) -> Result<bool> {
        Self::identity_of(name).map(|identity| identity.is_some())
    }

    /// Unmap the region, reporting failure instead of swallowing it in `Drop`.
    pub fn detach(mut self) -> Result<()> {
        self.mapped = false;
        // SAFETY: ptr/len describe a live mapping created by `map`, and
        // `mapped = false` keeps Drop from unmapping it a second time.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } != 0 {
            return Err(RegionError::Detach {
                name: self.os_name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        debug!(name = %self.os_name, "detached shared region");
        Ok(())
    }
}

#[cfg(not(unix))]
impl SharedRegion {
    pub fn create(_name: &str, _len: usize) -> Result<Self> {
        Err(RegionError::Unsupported)
    }

    pub fn create_with_mode(_name: &str, _len: usize, _mode: u32) -> Result<Self> {
        Err(RegionError::Unsupported)
    }

    pub fn open(_name: &str, _min_len: usize) -> Result<Self> {
        Err(RegionError::Unsupported)
    }

    pub fn unlink(_name: &str) -> Result<bool> {
        Err(RegionError::Unsupported)
    }

    pub fn identity_of(_name: &str) -> Result<Option<RegionIdentity>> {
        Err(RegionError::Unsupported)
    }

    pub fn exists(_name: &str) -> Result<bool> {
        Err(RegionError::Unsupported)
    }

    pub fn detach(self) -> Result<()> {
        Err(RegionError::Unsupported)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        if self.mapped {
            unmap(self.ptr, self.len);
        }
    }
}

#[cfg(unix)]
fn c_string(os: &str) -> Result<CString> {
    CString::new(os).map_err(|_| RegionError::InvalidName(os.to_string()))
}

#[cfg(unix)]
fn map(fd: &OwnedFd, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: fd is a valid descriptor sized to at least `len` bytes; the
    // kernel picks the address.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
}

#[cfg(unix)]
fn unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: ptr/len describe a live mapping created by `map`.
    if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
        debug!(error = %io::Error::last_os_error(), "munmap failed");
    }
}

#[cfg(unix)]
fn fstat(fd: &OwnedFd) -> io::Result<libc::stat> {
    // SAFETY: all-zero is a valid bit pattern for `libc::stat`.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is valid and `st` is a writable stat buffer.
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

#[cfg(unix)]
fn identity_of_fd(fd: &OwnedFd) -> io::Result<RegionIdentity> {
    fstat(fd).map(|st| identity_from_stat(&st))
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn identity_from_stat(st: &libc::stat) -> RegionIdentity {
    RegionIdentity {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
    }
}
