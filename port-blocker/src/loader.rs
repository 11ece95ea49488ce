use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use aya::{Ebpf, EbpfError, EbpfLoader, programs::Program};
use aya_obj::{Object, ProgramSection};
use log::debug;

use crate::error::{Error, ResourceKind, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgramKind {
    /// Runs on the interface receive path; the only kind we attach
    Xdp,
    SchedClassifier,
    Other,
}

impl ProgramKind {
    fn from_section(section: &ProgramSection) -> Self {
        match section {
            ProgramSection::Xdp { .. } => ProgramKind::Xdp,
            ProgramSection::SchedClassifier { .. } => ProgramKind::SchedClassifier,
            _ => ProgramKind::Other,
        }
    }

    fn from_program(program: &Program) -> Self {
        match program {
            Program::Xdp(_) => ProgramKind::Xdp,
            Program::SchedClassifier(_) => ProgramKind::SchedClassifier,
            _ => ProgramKind::Other,
        }
    }
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProgramKind::Xdp => "xdp",
            ProgramKind::SchedClassifier => "classifier",
            ProgramKind::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgramDef {
    pub name: String,
    pub kind: ProgramKind,
}

impl ProgramDef {
    pub fn new(name: impl Into<String>, kind: ProgramKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Parsed, not yet loaded, contents of a compiled image.
///
/// Programs and tables are kept in name order so that every scan over them
/// is deterministic.
#[derive(Debug)]
pub struct ProgramSpecification {
    path: PathBuf,
    bytes: Vec<u8>,
    programs: Vec<ProgramDef>,
    tables: Vec<String>,
}

impl ProgramSpecification {
    /// Build a specification from already known definitions.
    pub fn from_parts(
        path: impl Into<PathBuf>,
        bytes: Vec<u8>,
        mut programs: Vec<ProgramDef>,
        mut tables: Vec<String>,
    ) -> Self {
        programs.sort_by(|a, b| a.name.cmp(&b.name));
        tables.sort();
        Self {
            path: path.into(),
            bytes,
            programs,
            tables,
        }
    }

    fn from_bytes(path: &Path, bytes: Vec<u8>) -> Result<Self> {
        let object = Object::parse(&bytes).map_err(|source| Error::MalformedImage {
            path: path.to_path_buf(),
            source,
        })?;

        let programs = object
            .programs
            .iter()
            .map(|(name, program)| {
                ProgramDef::new(name.as_str(), ProgramKind::from_section(&program.section))
            })
            .collect();
        // `.data`, `.bss` and `.rodata` are globals, not tables the image declares.
        let tables = object
            .maps
            .keys()
            .filter(|name| !name.starts_with('.'))
            .cloned()
            .collect();

        Ok(Self::from_parts(path, bytes, programs, tables))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn programs(&self) -> &[ProgramDef] {
        &self.programs
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Fail before touching the kernel when the image lacks `name`.
    pub fn require_table(&self, name: &str) -> Result<()> {
        if self.tables.iter().any(|table| table == name) {
            Ok(())
        } else {
            Err(Error::not_found(ResourceKind::Table, name))
        }
    }
}

/// Read and parse the compiled image at `path`.
pub fn parse(path: &Path) -> Result<ProgramSpecification> {
    let bytes = fs::read(path).map_err(|source| Error::ImageNotFound {
        path: path.to_path_buf(),
        source,
    })?;
    let spec = ProgramSpecification::from_bytes(path, bytes)?;
    debug!(
        "parsed {}: programs={:?} tables={:?}",
        path.display(),
        spec.programs,
        spec.tables
    );
    Ok(spec)
}

/// Create every table and load every attachable program of `spec`.
///
/// The returned `Ebpf` owns all descriptors. On error it is dropped before
/// returning, which closes whatever had already been created.
pub fn realize(spec: &ProgramSpecification) -> Result<Ebpf> {
    let mut bpf = EbpfLoader::new()
        .load(&spec.bytes)
        .map_err(|source| Error::Realize {
            object: spec.path.display().to_string(),
            source,
        })?;

    for (name, program) in bpf.programs_mut() {
        let loaded = match program {
            Program::Xdp(xdp) => xdp.load(),
            Program::SchedClassifier(tc) => tc.load(),
            _ => {
                debug!("leaving program {name} unloaded");
                continue;
            }
        };
        loaded.map_err(|err| Error::Realize {
            object: format!("program {name}"),
            source: EbpfError::ProgramError(err),
        })?;
        debug!("loaded program {name}");
    }

    Ok(bpf)
}

/// Name and kind of every program in a realized collection, in name order.
pub fn realized_programs(bpf: &Ebpf) -> Vec<ProgramDef> {
    let mut programs: Vec<ProgramDef> = bpf
        .programs()
        .map(|(name, program)| ProgramDef::new(name, ProgramKind::from_program(program)))
        .collect();
    programs.sort_by(|a, b| a.name.cmp(&b.name));
    programs
}
