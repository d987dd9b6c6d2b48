use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::Path,
};

/// Thin libc wrappers for the metadata the `tar` round-trip must carry:
/// ownership (including on symlinks) and nanosecond timestamps. Callers
/// treat failures as per-file warnings, never pipeline-fatal.

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

pub fn chown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let p = c_path(path)?;
    let rc = unsafe { libc::chown(p.as_ptr(), uid, gid) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

/// Ownership on the link itself, not its target.
pub fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let p = c_path(path)?;
    let rc = unsafe { libc::lchown(p.as_ptr(), uid, gid) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// atime+mtime to nanosecond precision. `follow=false` applies to the
/// symlink itself (AT_SYMLINK_NOFOLLOW).
pub fn set_times_ns(
    path: &Path,
    atime: (i64, i64),
    mtime: (i64, i64),
    follow: bool,
) -> io::Result<()> {
    let p = c_path(path)?;
    let times = [
        libc::timespec {
            tv_sec: atime.0,
            tv_nsec: atime.1,
        },
        libc::timespec {
            tv_sec: mtime.0,
            tv_nsec: mtime.1,
        },
    ];
    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, p.as_ptr(), times.as_ptr(), flags) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_times_roundtrips_nanoseconds() {
        let tmp = TempDir::new().unwrap();
        let f = tmp.path().join("stamped");
        std::fs::write(&f, b"x").unwrap();

        set_times_ns(&f, (1_700_000_000, 123), (1_700_000_100, 456_789), true).unwrap();

        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(&f).unwrap();
        assert_eq!(meta.mtime(), 1_700_000_100);
        assert_eq!(meta.mtime_nsec(), 456_789);
        assert_eq!(meta.atime(), 1_700_000_000);
        assert_eq!(meta.atime_nsec(), 123);
    }

    #[test]
    fn symlink_times_do_not_touch_target() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        let link = tmp.path().join("link");
        std::fs::write(&target, b"x").unwrap();
        set_times_ns(&target, (1_600_000_000, 0), (1_600_000_000, 0), true).unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        set_times_ns(&link, (1_700_000_000, 0), (1_700_000_000, 0), false).unwrap();

        use std::os::unix::fs::MetadataExt;
        assert_eq!(std::fs::metadata(&target).unwrap().mtime(), 1_600_000_000);
        assert_eq!(
            std::fs::symlink_metadata(&link).unwrap().mtime(),
            1_700_000_000
        );
    }

    #[test]
    fn set_mode_applies_permission_bits() {
        let tmp = TempDir::new().unwrap();
        let f = tmp.path().join("modal");
        std::fs::write(&f, b"x").unwrap();
        set_mode(&f, 0o640).unwrap();

        use std::os::unix::fs::MetadataExt;
        assert_eq!(std::fs::metadata(&f).unwrap().mode() & 0o7777, 0o640);
    }

    // chown/lchown need root to change anything; chown-to-self is the
    // portable smoke test
    #[test]
    fn chown_to_current_owner_succeeds() {
        let tmp = TempDir::new().unwrap();
        let f = tmp.path().join("owned");
        std::fs::write(&f, b"x").unwrap();

        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(&f).unwrap();
        chown(&f, meta.uid(), meta.gid()).unwrap();

        let link = tmp.path().join("ownlink");
        std::os::unix::fs::symlink(&f, &link).unwrap();
        let lmeta = std::fs::symlink_metadata(&link).unwrap();
        lchown(&link, lmeta.uid(), lmeta.gid()).unwrap();
    }
}
