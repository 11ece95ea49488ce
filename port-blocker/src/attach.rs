use std::{ffi::CString, io};

use aya::{
    Ebpf,
    programs::{ProgramError, Xdp, XdpFlags, xdp::XdpLinkId},
};
use log::debug;

use crate::{
    config::{SelectionPolicy, XdpMode},
    error::{Error, ResourceKind, Result},
    loader::{ProgramDef, ProgramKind},
};

/// Pick the program that goes on the receive path.
///
/// With `preferred` set, that program must exist and be XDP. Otherwise every
/// program is scanned in order and, under [`SelectionPolicy::LastSeenWins`],
/// the last XDP program seen is returned.
pub fn select_filtering_program<'a>(
    programs: &'a [ProgramDef],
    preferred: Option<&str>,
    policy: SelectionPolicy,
) -> Result<&'a ProgramDef> {
    if let Some(name) = preferred {
        let program = programs
            .iter()
            .find(|program| program.name == name)
            .ok_or_else(|| Error::not_found(ResourceKind::Program, name))?;
        if program.kind != ProgramKind::Xdp {
            return Err(Error::Selection(format!(
                "program {name} is a {} program, not xdp",
                program.kind
            )));
        }
        return Ok(program);
    }

    let mut selected = None;
    let mut matches = 0usize;
    for program in programs {
        debug!("program {} ({})", program.name, program.kind);
        if program.kind == ProgramKind::Xdp {
            selected = Some(program);
            matches += 1;
        }
    }

    match (selected, policy) {
        (None, _) => Err(Error::not_found(ResourceKind::Program, "of kind xdp")),
        (Some(_), SelectionPolicy::Reject) if matches > 1 => Err(Error::Selection(format!(
            "{matches} xdp programs found; pass --program to choose one"
        ))),
        (Some(program), _) => Ok(program),
    }
}

/// Look up `iface` in the host interface table.
pub fn resolve_interface(iface: &str) -> Result<u32> {
    let not_found = || Error::not_found(ResourceKind::Interface, iface);
    let ifname = CString::new(iface).map_err(|_| not_found())?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        debug!(
            "if_nametoindex({iface}) failed: {}",
            io::Error::last_os_error()
        );
        return Err(not_found());
    }
    Ok(ifindex)
}

pub fn attach_xdp(bpf: &mut Ebpf, program: &str, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
    let ifindex = resolve_interface(iface)?;
    let attach_err = |source: ProgramError| Error::Attach {
        program: program.to_string(),
        iface: iface.to_string(),
        source,
    };
    let xdp: &mut Xdp = bpf
        .program_mut(program)
        .ok_or_else(|| Error::not_found(ResourceKind::Program, program))?
        .try_into()
        .map_err(attach_err)?;
    let link = xdp.attach(iface, xdp_flags(mode)).map_err(attach_err)?;
    debug!("attached {program} to {iface} (ifindex {ifindex}, {mode:?})");
    Ok(link)
}

pub fn detach_xdp(bpf: &mut Ebpf, program: &str, link: XdpLinkId) -> Result<()> {
    let detach_err = |source: ProgramError| Error::Detach {
        program: program.to_string(),
        source,
    };
    let xdp: &mut Xdp = bpf
        .program_mut(program)
        .ok_or_else(|| Error::not_found(ResourceKind::Program, program))?
        .try_into()
        .map_err(detach_err)?;
    xdp.detach(link).map_err(detach_err)
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Auto => XdpFlags::default(),
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}
