//! POSIX permission checks against synthesised attributes.

use std::ffi::CStr;

use crate::config::MountOptions;
use crate::error::{FsError, Result};
use crate::stat::FileStat;

/// The caller identity of one FUSE request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
}

/// Access mask bits, mirroring `R_OK`/`W_OK`/`X_OK`; zero is `F_OK`.
pub const F_OK: u32 = 0;
pub const X_OK: u32 = 1;
pub const W_OK: u32 = 2;
pub const R_OK: u32 = 4;

/// Check `mask` access to an object with attributes `st`.
///
/// Root and a configured synthetic uid bypass everything; `F_OK` is a bare
/// existence test (the caller already proved existence by producing `st`).
/// Otherwise the effective mode is `st.mode` (or the configured umask
/// override) filtered through the owner/group/other mask for this caller.
pub fn check_access(
    ctx: &RequestContext,
    opts: &MountOptions,
    st: &FileStat,
    mask: u32,
) -> Result<()> {
    if ctx.uid == 0 {
        return Ok(());
    }
    if opts.bosfs_uid.is_some_and(|uid| uid == ctx.uid) {
        return Ok(());
    }
    if mask == F_OK {
        return Ok(());
    }

    let obj_uid = opts.bosfs_uid.unwrap_or(st.uid);
    let obj_gid = opts.bosfs_gid.unwrap_or(st.gid);
    let mode = match opts.bosfs_mask {
        Some(umask) => 0o777 & !umask,
        None => st.mode,
    };

    let mut base_mask = 0o007u32;
    if ctx.uid == obj_uid {
        base_mask |= 0o700;
    }
    if ctx.gid == obj_gid || uid_in_group(ctx.uid, obj_gid) {
        base_mask |= 0o070;
    }
    let mode = mode & base_mask;

    if mask & X_OK != 0 && mode & 0o111 == 0 {
        return Err(FsError::Access("execute".to_string()));
    }
    if mask & W_OK != 0 && mode & 0o222 == 0 {
        return Err(FsError::Access("write".to_string()));
    }
    if mask & R_OK != 0 && mode & 0o444 == 0 {
        return Err(FsError::Access("read".to_string()));
    }
    if mode == 0 {
        return Err(FsError::Access("no permission bits".to_string()));
    }
    Ok(())
}

/// Ownership check for chmod-like operations: root, the synthetic uid and
/// the object owner pass, everybody else gets `EPERM`.
pub fn check_owner(ctx: &RequestContext, opts: &MountOptions, st: &FileStat) -> Result<()> {
    if ctx.uid == 0 {
        return Ok(());
    }
    if opts.bosfs_uid.is_some_and(|uid| uid == ctx.uid) {
        return Ok(());
    }
    if ctx.uid == st.uid {
        return Ok(());
    }
    Err(FsError::NotPermitted("not the owner".to_string()))
}

/// Whether `uid`'s user is a supplementary member of `gid`.
pub fn uid_in_group(uid: u32, gid: u32) -> bool {
    let Some(username) = username_of(uid) else {
        return false;
    };
    let mut group = unsafe { std::mem::zeroed::<libc::group>() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrgid_r(
            gid,
            &mut group,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return false;
    }
    let mut member = group.gr_mem;
    unsafe {
        while !member.is_null() && !(*member).is_null() {
            if CStr::from_ptr(*member).to_string_lossy() == username {
                return true;
            }
            member = member.add(1);
        }
    }
    false
}

fn username_of(uid: u32) -> Option<String> {
    let mut passwd = unsafe { std::mem::zeroed::<libc::passwd>() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut passwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    unsafe {
        Some(
            CStr::from_ptr(passwd.pw_name)
                .to_string_lossy()
                .into_owned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> MountOptions {
        MountOptions::default()
    }

    fn stat_with(mode: u32, uid: u32, gid: u32) -> FileStat {
        FileStat {
            mode,
            uid,
            gid,
            ..Default::default()
        }
    }

    #[test]
    fn root_bypasses_everything() {
        let ctx = RequestContext { uid: 0, gid: 0 };
        let st = stat_with(0, 1000, 1000);
        assert!(check_access(&ctx, &opts(), &st, R_OK | W_OK | X_OK).is_ok());
        assert!(check_owner(&ctx, &opts(), &st).is_ok());
    }

    #[test]
    fn owner_bits_apply_to_the_owner() {
        let ctx = RequestContext {
            uid: 1000,
            gid: 1000,
        };
        let st = stat_with(libc::S_IFREG | 0o600, 1000, 1000);
        assert!(check_access(&ctx, &opts(), &st, R_OK | W_OK).is_ok());
        assert!(check_access(&ctx, &opts(), &st, X_OK).is_err());

        let other = RequestContext {
            uid: 2000,
            gid: 2000,
        };
        assert!(check_access(&other, &opts(), &st, R_OK).is_err());
    }

    #[test]
    fn f_ok_is_existence_only() {
        let ctx = RequestContext {
            uid: 2000,
            gid: 2000,
        };
        let st = stat_with(libc::S_IFREG, 1000, 1000);
        assert!(check_access(&ctx, &opts(), &st, F_OK).is_ok());
    }

    #[test]
    fn synthetic_uid_bypasses() {
        let ctx = RequestContext {
            uid: 4242,
            gid: 4242,
        };
        let mut o = opts();
        o.bosfs_uid = Some(4242);
        let st = stat_with(0, 0, 0);
        assert!(check_access(&ctx, &o, &st, R_OK | W_OK | X_OK).is_ok());
        assert!(check_owner(&ctx, &o, &st).is_ok());
    }

    #[test]
    fn umask_override_replaces_object_mode() {
        let ctx = RequestContext {
            uid: 1000,
            gid: 1000,
        };
        let mut o = opts();
        o.bosfs_mask = Some(0o222);
        // Object says no access at all, but the override grants r-x.
        let st = stat_with(libc::S_IFREG, 1000, 1000);
        assert!(check_access(&ctx, &o, &st, R_OK | X_OK).is_ok());
        assert!(check_access(&ctx, &o, &st, W_OK).is_err());
    }

    #[test]
    fn owner_check_rejects_strangers() {
        let ctx = RequestContext {
            uid: 2000,
            gid: 2000,
        };
        let st = stat_with(libc::S_IFREG | 0o777, 1000, 1000);
        assert!(matches!(
            check_owner(&ctx, &opts(), &st),
            Err(FsError::NotPermitted(_))
        ));
    }
}
