use std::io::{Read, Seek, Write};

use crate::backend::Backend;
use crate::error::{Result, StoreError};
use crate::store::Storage;
use crate::vtable::{VTable, VTableSave};

const SUPER_MAGIC: [u8; 4] = *b"DRIP";
const VERSION: u32 = 3;

/// Fixed sizing shared by every component once a store exists. Everything is
/// derived from the raw block size and the ciphertext header length; the
/// derived values are persisted implicitly through those two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub blocksize: usize,
    pub headerlen: usize,
    pub total_blocks: usize,
    /// Payload capacity of one half of a slot.
    pub fbsize: usize,
    /// Most fragments a split half may hold.
    pub split_maxnum: usize,
    /// Occupancy budget of a split half, framing included.
    pub split_maxsize: usize,
}

impl Geometry {
    pub fn new(blocksize: usize, headerlen: usize, total_blocks: usize) -> Result<Self> {
        let split_maxnum = 1 << 10;

        let fbsize = blocksize
            .checked_sub(headerlen + 200)
            .map(|room| room / 2)
            .filter(|&fbsize| fbsize > 0)
            .ok_or(StoreError::InvalidArgument("block size leaves no room for fragments"))?;

        let split_maxsize = fbsize
            .checked_sub(10 * split_maxnum)
            .filter(|&max| max > 0)
            .ok_or(StoreError::InvalidArgument("block size leaves no room for split fragments"))?;

        if total_blocks < 1 {
            return StoreError::invalid("a store needs at least one block");
        }

        Ok(Self {
            blocksize,
            headerlen,
            total_blocks,
            fbsize,
            split_maxnum,
            split_maxsize,
        })
    }

    /// Plaintext bytes stored per slot; the ciphertext header fills the rest.
    pub fn payload(&self) -> usize {
        self.blocksize - self.headerlen
    }

    /// Total bytes the backend can hold.
    pub fn capacity(&self) -> usize {
        self.blocksize * self.total_blocks
    }
}

/// The root record living at slot 0: the vtable plus the parameters every
/// other slot's layout depends on.
///
/// # Binary Layout (Little-Endian)
/// ```text
/// Offset  Size     Field
/// -------------------------------
/// 0       4 B      Magic number ("DRIP")
/// 4       4 B      Version
/// 8       8 B      Block size
/// 16      8 B      Total blocks
/// 24      4 B      Ciphertext header length
/// 28+     N B      VTable save data (see `VTableSave`)
/// ```
///
/// The record is zero-padded to the full slot payload before it is handed to
/// the backend, so its encrypted form is indistinguishable from a data slot.
#[derive(Debug)]
pub struct SuperBlock {
    pub vtable: VTable,
    pub geom: Geometry,
}

impl SuperBlock {
    pub fn create(blocksize: usize, total_blocks: usize, headerlen: usize) -> Result<Self> {
        let geom = Geometry::new(blocksize, headerlen, total_blocks)?;
        Ok(Self {
            vtable: VTable::create(geom.fbsize, geom.split_maxsize),
            geom,
        })
    }

    const HEADER: usize = 28;
}

impl<Backing: Read + Write + Seek> Storage<Backing> for SuperBlock {
    fn read(mut source: Backing) -> Result<Self> {
        let mut buffer = vec![0u8; Self::HEADER];
        source.read_exact(&mut buffer)?;

        if buffer[0..4] != SUPER_MAGIC {
            return StoreError::corrupt("slot 0 does not hold a root record");
        }

        let version = u32::from_le_bytes(buffer[4..8].try_into()?);
        if version != VERSION {
            return Err(StoreError::IncompatibleVersion(version).into());
        }

        let blocksize = u64::from_le_bytes(buffer[8..16].try_into()?) as usize;
        let total_blocks = u64::from_le_bytes(buffer[16..24].try_into()?) as usize;
        let headerlen = u32::from_le_bytes(buffer[24..28].try_into()?) as usize;

        let geom = Geometry::new(blocksize, headerlen, total_blocks)?;
        let save = VTableSave::read(&mut source)?;

        Ok(Self {
            vtable: VTable::load(save, geom.fbsize, geom.split_maxsize),
            geom,
        })
    }

    fn write(&mut self, mut source: Backing) -> Result<()> {
        let mut buffer = vec![0u8; Self::HEADER];

        buffer[0..4].copy_from_slice(&SUPER_MAGIC);
        buffer[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buffer[8..16].copy_from_slice(&(self.geom.blocksize as u64).to_le_bytes());
        buffer[16..24].copy_from_slice(&(self.geom.total_blocks as u64).to_le_bytes());
        buffer[24..28].copy_from_slice(&(self.geom.headerlen as u32).to_le_bytes());

        source.write_all(&buffer)?;
        self.vtable.save().write(&mut source)?;

        Ok(())
    }
}

/// Reads the root record back from slot 0. `Ok(None)` means the backend has
/// never been written; decryption or parse failures are real errors, since
/// treating them as a fresh store would silently discard everything.
pub fn load_superblock(backend: &Backend) -> Result<Option<SuperBlock>> {
    match backend.get(0)? {
        None => Ok(None),
        Some(raw) => SuperBlock::read(std::io::Cursor::new(raw)).map(Some),
    }
}

/// Persists the vtable and geometry to slot 0, padded to a full slot.
pub fn save_superblock(backend: &Backend, vtable: &VTable, geom: Geometry) -> Result<()> {
    let mut buffer = Vec::with_capacity(geom.payload());
    {
        let mut cursor = std::io::Cursor::new(&mut buffer);
        let mut record = [0u8; SuperBlock::HEADER];
        record[0..4].copy_from_slice(&SUPER_MAGIC);
        record[4..8].copy_from_slice(&VERSION.to_le_bytes());
        record[8..16].copy_from_slice(&(geom.blocksize as u64).to_le_bytes());
        record[16..24].copy_from_slice(&(geom.total_blocks as u64).to_le_bytes());
        record[24..28].copy_from_slice(&(geom.headerlen as u32).to_le_bytes());
        cursor.write_all(&record)?;
        vtable.save().write(&mut cursor)?;
    }

    if buffer.len() > geom.payload() {
        return StoreError::invalid("root record does not fit in a single slot");
    }
    buffer.resize(geom.payload(), 0);

    backend.set(0, &buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn geometry_derivation() {
        let geom = Geometry::new(1 << 16, 48, 1 << 10).unwrap();
        assert_eq!(geom.fbsize, ((1 << 16) - 48 - 200) / 2);
        assert_eq!(geom.split_maxsize, geom.fbsize - 10 * 1024);
        assert_eq!(geom.payload(), (1 << 16) - 48);
    }

    #[test]
    fn geometry_rejects_tiny_blocks() {
        assert!(Geometry::new(512, 48, 16).is_err());
        assert!(Geometry::new(1 << 16, 48, 0).is_err());
    }

    #[test]
    fn root_record_roundtrip() {
        let mut sup = SuperBlock::create(1 << 16, 64, 48).unwrap();
        let vnode = sup.vtable.allocate();
        sup.vtable.change_inode(vnode, 0, 100).unwrap();

        let mut raw = Vec::new();
        sup.write(Cursor::new(&mut raw)).unwrap();

        let loaded = SuperBlock::read(Cursor::new(raw)).unwrap();
        assert_eq!(loaded.geom, sup.geom);
        assert!(loaded.vtable.contains(vnode));
    }

    #[test]
    fn version_mismatch_is_detected() {
        let mut sup = SuperBlock::create(1 << 16, 64, 48).unwrap();
        let mut raw = Vec::new();
        sup.write(Cursor::new(&mut raw)).unwrap();
        raw[4..8].copy_from_slice(&999u32.to_le_bytes());

        assert!(SuperBlock::read(Cursor::new(raw)).is_err());
    }
}
