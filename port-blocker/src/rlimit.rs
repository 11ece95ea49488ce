use std::io;

use log::debug;

use crate::error::{Error, Result};

/// Lift `RLIMIT_MEMLOCK` so maps and programs can be locked into kernel memory.
///
/// Safe to call repeatedly: an already unlimited soft and hard limit is left alone.
pub fn relax_memlock() -> Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut current) };
    if rc == 0 && is_unlimited(&current) {
        debug!("locked-memory limit already unlimited");
        return Ok(());
    }

    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if rc != 0 {
        return Err(Error::Privilege(io::Error::last_os_error()));
    }
    debug!(
        "raised locked-memory limit from {}/{} to unlimited",
        current.rlim_cur, current.rlim_max
    );
    Ok(())
}

fn is_unlimited(limit: &libc::rlimit) -> bool {
    limit.rlim_cur == libc::RLIM_INFINITY && limit.rlim_max == libc::RLIM_INFINITY
}
