use std::{fs, path::Path};

use aya::{
    maps::{Array, HashMap, Map, MapData, MapError},
    pin::PinError,
    sys::SyscallError,
};
use log::{debug, info, warn};
use port_blocker_common::{BLOCKED_PORT_KEY, PortKey, PortValue, UNSET_PORT};

use crate::error::{Error, Result};

/// Update flag accepted by every map type: create or overwrite.
const BPF_ANY: u64 = 0;

/// A `u32 -> u16` kernel table the filter consults on every packet.
///
/// There is no locking across processes: two writers racing on the same key
/// both succeed and whichever lands last is what the filter sees.
pub trait ControlTable {
    fn name(&self) -> &str;
    fn get(&self, key: PortKey) -> Result<Option<PortValue>>;
    fn insert(&mut self, key: PortKey, value: PortValue) -> Result<()>;
    fn pin(&mut self, path: &Path) -> Result<()>;
}

/// Store `port` as the port to drop, replacing whatever was there.
pub fn set_filtered_port<T: ControlTable + ?Sized>(table: &mut T, port: PortValue) -> Result<()> {
    table.insert(BLOCKED_PORT_KEY, port)?;
    debug!("{}[{BLOCKED_PORT_KEY}] = {port}", table.name());
    Ok(())
}

/// The port currently being dropped, if any.
pub fn filtered_port<T: ControlTable + ?Sized>(table: &T) -> Result<Option<PortValue>> {
    Ok(table
        .get(BLOCKED_PORT_KEY)?
        .filter(|port| *port != UNSET_PORT))
}

/// Publish `table` at `path` for later invocations.
///
/// Returns whether the table was pinned; a failure is only a warning since
/// the port has already been written by the time this runs.
pub fn pin_table<T: ControlTable + ?Sized>(table: &mut T, path: &Path) -> bool {
    match table.pin(path) {
        Ok(()) => {
            info!("pinned {} at {}", table.name(), path.display());
            true
        }
        Err(err) => {
            warn!("{}; later invocations will not find this table", err.report());
            false
        }
    }
}

/// Control table backed by a live BPF map.
pub struct KernelTable {
    name: String,
    map: Map,
}

impl KernelTable {
    pub fn new(name: impl Into<String>, map: Map) -> Result<Self> {
        let name = name.into();
        match map {
            Map::Array(_) | Map::HashMap(_) | Map::LruHashMap(_) => Ok(Self { name, map }),
            _ => Err(Error::TableType { table: name }),
        }
    }

    /// Reattach to a table pinned by an earlier invocation.
    pub fn from_pin(name: impl Into<String>, path: &Path) -> Result<Self> {
        let open_err = |source: MapError| Error::OpenPinned {
            path: path.to_path_buf(),
            source,
        };
        let map_data = MapData::from_pin(path).map_err(open_err)?;
        let map = Map::from_map_data(map_data).map_err(open_err)?;
        Self::new(name, map)
    }

    fn read_err(&self, source: MapError) -> Error {
        Error::Read {
            table: self.name.clone(),
            source,
        }
    }

    fn write_err(&self, value: PortValue, source: MapError) -> Error {
        Error::Write {
            table: self.name.clone(),
            port: value,
            source,
        }
    }
}

impl ControlTable for KernelTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: PortKey) -> Result<Option<PortValue>> {
        let looked_up = match self.map {
            Map::Array(_) => Array::<_, PortValue>::try_from(&self.map)
                .map_err(|e| self.read_err(e))?
                .get(&key, 0),
            _ => HashMap::<_, PortKey, PortValue>::try_from(&self.map)
                .map_err(|e| self.read_err(e))?
                .get(&key, 0),
        };
        match looked_up {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(err) => Err(self.read_err(err)),
        }
    }

    fn insert(&mut self, key: PortKey, value: PortValue) -> Result<()> {
        let written = match self.map {
            Map::Array(_) => Array::<_, PortValue>::try_from(&mut self.map)
                .and_then(|mut array| array.set(key, value, BPF_ANY)),
            _ => HashMap::<_, PortKey, PortValue>::try_from(&mut self.map)
                .and_then(|mut hash| hash.insert(key, value, BPF_ANY)),
        };
        written.map_err(|e| self.write_err(value, e))
    }

    fn pin(&mut self, path: &Path) -> Result<()> {
        let pin_err = |source: PinError| Error::Pin {
            table: self.name.clone(),
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|io_error| {
                pin_err(PinError::SyscallError(SyscallError {
                    call: "mkdir",
                    io_error,
                }))
            })?;
        }
        self.map.pin(path).map_err(pin_err)
    }
}
