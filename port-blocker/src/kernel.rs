//! The seam between the lifecycle logic and the kernel.
//!
//! [`Kernel`] and [`Collection`] cover every kernel operation the
//! orchestrator performs. [`AyaKernel`] is the real implementation; tests use
//! the recording fake in [`fake`].

use std::path::Path;

use aya::{Ebpf, programs::xdp::XdpLinkId};
use log::debug;

use crate::{
    attach,
    config::XdpMode,
    error::{Error, ResourceKind, Result},
    loader::{self, ProgramDef, ProgramSpecification},
    rlimit,
    table::{ControlTable, KernelTable},
};

pub trait Kernel {
    type Table: ControlTable;
    type Collection: Collection;

    fn relax_memlock(&mut self) -> Result<()>;
    fn open_pinned_table(&mut self, name: &str, path: &Path) -> Result<Self::Table>;
    fn parse_image(&mut self, path: &Path) -> Result<ProgramSpecification>;
    fn realize(&mut self, spec: &ProgramSpecification) -> Result<Self::Collection>;
}

/// Live programs and tables produced by [`Kernel::realize`].
pub trait Collection {
    type Table: ControlTable;
    type Link;

    fn programs(&self) -> Vec<ProgramDef>;
    /// Move a table out so it can outlive the collection.
    fn take_table(&mut self, name: &str) -> Result<Self::Table>;
    fn attach(&mut self, program: &str, iface: &str, mode: XdpMode) -> Result<Self::Link>;
    fn detach(&mut self, program: &str, link: Self::Link) -> Result<()>;
    /// Release every object still owned by the collection.
    fn close(self);
}

#[derive(Debug, Default)]
pub struct AyaKernel;

impl Kernel for AyaKernel {
    type Table = KernelTable;
    type Collection = AyaCollection;

    fn relax_memlock(&mut self) -> Result<()> {
        rlimit::relax_memlock()
    }

    fn open_pinned_table(&mut self, name: &str, path: &Path) -> Result<KernelTable> {
        KernelTable::from_pin(name, path)
    }

    fn parse_image(&mut self, path: &Path) -> Result<ProgramSpecification> {
        loader::parse(path)
    }

    fn realize(&mut self, spec: &ProgramSpecification) -> Result<AyaCollection> {
        loader::realize(spec).map(|bpf| AyaCollection { bpf })
    }
}

pub struct AyaCollection {
    bpf: Ebpf,
}

impl Collection for AyaCollection {
    type Table = KernelTable;
    type Link = XdpLinkId;

    fn programs(&self) -> Vec<ProgramDef> {
        loader::realized_programs(&self.bpf)
    }

    fn take_table(&mut self, name: &str) -> Result<KernelTable> {
        let map = self
            .bpf
            .take_map(name)
            .ok_or_else(|| Error::not_found(ResourceKind::Table, name))?;
        KernelTable::new(name, map)
    }

    fn attach(&mut self, program: &str, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
        attach::attach_xdp(&mut self.bpf, program, iface, mode)
    }

    fn detach(&mut self, program: &str, link: XdpLinkId) -> Result<()> {
        attach::detach_xdp(&mut self.bpf, program, link)
    }

    fn close(self) {
        debug!("closing realized collection");
        drop(self.bpf);
    }
}
