use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use crate::backend::Backend;
use crate::error::{Result, StoreError};
use crate::superblock::Geometry;
use crate::{Inode, Vnode};

const TAG_EMPTY: u8 = 0;
const TAG_SPLIT: u8 = 1;
const TAG_FULL: u8 = 2;

/// Serialized framing charged per fragment: vnode (8) plus length (4).
const ENTRY_OVERHEAD: usize = 12;

/// Logical contents of one half of a backend slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHalf {
    Empty,
    /// Several small fragments keyed by vnode. Only tail fragments are ever
    /// small enough to land here, so one key per vnode suffices.
    Split(BTreeMap<Vnode, Vec<u8>>),
    /// One large fragment owning the entire half.
    Full(Vnode, Vec<u8>),
}

/// One half of a slot as the drip works with it: contents plus a record of
/// which fragments were packed into it this cycle.
#[derive(Debug, Clone)]
pub struct Block {
    geom: Geometry,
    half: BlockHalf,
    added: Vec<(Vnode, usize)>,
}

impl Block {
    pub fn empty(geom: Geometry) -> Self {
        Self {
            geom,
            half: BlockHalf::Empty,
            added: Vec::new(),
        }
    }

    pub fn half(&self) -> &BlockHalf {
        &self.half
    }

    /// Occupied bytes as they will serialize, framing included. Charging the
    /// framing here is what keeps a fully packed slot inside the padded
    /// payload region.
    pub fn size(&self) -> usize {
        match &self.half {
            BlockHalf::Empty => 0,
            BlockHalf::Split(map) => map.values().map(|data| ENTRY_OVERHEAD + data.len()).sum(),
            BlockHalf::Full(_, data) => ENTRY_OVERHEAD + data.len(),
        }
    }

    /// How many more fragment bytes this half can still take.
    pub fn space_avail(&self) -> usize {
        match &self.half {
            BlockHalf::Empty => self.geom.fbsize,
            BlockHalf::Split(map) if map.len() < self.geom.split_maxnum => {
                self.geom.split_maxsize.saturating_sub(self.size())
            }
            _ => 0,
        }
    }

    /// If the fragment fits, stores it and remembers the placement.
    /// A fragment too large for a split half claims an empty half whole.
    pub fn add_if(&mut self, vnode: Vnode, boff: usize, data: &[u8]) -> bool {
        if matches!(self.half, BlockHalf::Empty) && data.len() > self.geom.split_maxsize {
            if data.len() > self.geom.fbsize {
                return false;
            }
            self.half = BlockHalf::Full(vnode, data.to_vec());
            self.added.push((vnode, boff));
            return true;
        }

        if ENTRY_OVERHEAD + data.len() > self.space_avail() {
            return false;
        }

        if matches!(self.half, BlockHalf::Empty) {
            self.half = BlockHalf::Split(BTreeMap::new());
        }
        let BlockHalf::Split(map) = &mut self.half else {
            return false;
        };
        map.insert(vnode, data.to_vec());
        self.added.push((vnode, boff));
        true
    }

    /// Placements recorded by `add_if`, for the post-drip vtable update.
    pub fn added(&self) -> &[(Vnode, usize)] {
        &self.added
    }

    /// Drops every fragment the predicate disowns. A split half that empties
    /// out, or a full half whose owner is gone, demotes to Empty.
    pub fn retain_live(&mut self, mut live: impl FnMut(Vnode) -> bool) {
        let emptied = match &mut self.half {
            BlockHalf::Empty => false,
            BlockHalf::Split(map) => {
                map.retain(|&vnode, _| live(vnode));
                map.is_empty()
            }
            BlockHalf::Full(vnode, _) => !live(*vnode),
        };
        if emptied {
            self.half = BlockHalf::Empty;
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match &self.half {
            BlockHalf::Empty => out.push(TAG_EMPTY),
            BlockHalf::Split(map) => {
                out.push(TAG_SPLIT);
                out.extend_from_slice(&(map.len() as u32).to_le_bytes());
                for (vnode, data) in map {
                    out.extend_from_slice(&vnode.to_le_bytes());
                    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    out.extend_from_slice(data);
                }
            }
            BlockHalf::Full(vnode, data) => {
                out.push(TAG_FULL);
                out.extend_from_slice(&vnode.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
        }
    }

    fn decode(geom: Geometry, source: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut tag = [0u8; 1];
        source.read_exact(&mut tag)?;

        let half = match tag[0] {
            TAG_EMPTY => BlockHalf::Empty,
            TAG_SPLIT => {
                let mut head = [0u8; 4];
                source.read_exact(&mut head)?;
                let count = u32::from_le_bytes(head) as usize;
                if count * ENTRY_OVERHEAD > geom.payload() {
                    return StoreError::corrupt("split half claims more entries than a slot can hold");
                }

                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let mut head = [0u8; 12];
                    source.read_exact(&mut head)?;
                    let vnode = Vnode::from_le_bytes(head[0..8].try_into()?);
                    let len = u32::from_le_bytes(head[8..12].try_into()?) as usize;
                    if len > geom.fbsize {
                        return StoreError::corrupt("fragment length exceeds a half block");
                    }
                    let mut data = vec![0u8; len];
                    source.read_exact(&mut data)?;
                    map.insert(vnode, data);
                }
                BlockHalf::Split(map)
            }
            TAG_FULL => {
                let mut head = [0u8; 12];
                source.read_exact(&mut head)?;
                let vnode = Vnode::from_le_bytes(head[0..8].try_into()?);
                let len = u32::from_le_bytes(head[8..12].try_into()?) as usize;
                if len > geom.fbsize {
                    return StoreError::corrupt("fragment length exceeds a half block");
                }
                let mut data = vec![0u8; len];
                source.read_exact(&mut data)?;
                BlockHalf::Full(vnode, data)
            }
            _ => return StoreError::corrupt("unknown block tag"),
        };

        Ok(Self {
            geom,
            half,
            added: Vec::new(),
        })
    }
}

/// Merges two split halves into the left one when their combined occupancy
/// fits a single half, freeing the right half for a large fragment.
pub fn coalesce_splits(pair: &mut [Block; 2]) {
    let both_split = matches!(pair[0].half, BlockHalf::Split(_)) && matches!(pair[1].half, BlockHalf::Split(_));
    if !both_split || pair[0].size() + pair[1].size() > pair[0].geom.split_maxsize {
        return;
    }

    let BlockHalf::Split(right) = std::mem::replace(&mut pair[1].half, BlockHalf::Empty) else {
        return;
    };
    let BlockHalf::Split(left) = &mut pair[0].half else {
        return;
    };
    left.extend(right);
}

/// Serializes both halves of a slot, zero-padded to the slot payload.
///
/// # Binary Layout (Little-Endian)
/// ```text
/// Offset  Size     Field (per half, two halves back to back)
/// -------------------------------
/// 0       1 B      Tag (0 empty, 1 split, 2 full)
/// split:
/// 1       4 B      Entry count
/// 5+      12+N B   Per entry: vnode (8), length (4), fragment bytes
/// full:
/// 1       12 B     Vnode (8), length (4)
/// 13      N B      Fragment bytes
/// ```
pub fn encode_slot(geom: Geometry, pair: &[Block; 2]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(geom.payload());
    pair[0].encode_into(&mut out);
    pair[1].encode_into(&mut out);

    if out.len() > geom.payload() {
        return StoreError::invalid("slot contents exceed the payload region");
    }
    out.resize(geom.payload(), 0);

    Ok(out)
}

pub fn decode_slot(geom: Geometry, raw: &[u8]) -> Result<[Block; 2]> {
    let mut source = Cursor::new(raw);
    Ok([
        Block::decode(geom, &mut source)?,
        Block::decode(geom, &mut source)?,
    ])
}

/// Fetches and decodes one slot. Missing slots are simply a young store;
/// undecipherable or unparseable slots are isolated to a warning and an
/// empty pair, so one bad slot never takes the engine down.
pub(crate) fn fetch_slot(backend: &Backend, geom: Geometry, ind: usize) -> [Block; 2] {
    let raw = match backend.get(ind) {
        Ok(Some(raw)) => raw,
        Ok(None) => return [Block::empty(geom), Block::empty(geom)],
        Err(err) => {
            log::warn!("error fetching slot {ind} from the backend (wrong key?): {err}");
            return [Block::empty(geom), Block::empty(geom)];
        }
    };

    match decode_slot(geom, &raw) {
        Ok(pair) => pair,
        Err(err) => {
            log::warn!("slot {ind} from the backend did not parse: {err}");
            [Block::empty(geom), Block::empty(geom)]
        }
    }
}

/// Reads the fragment of `vnode` stored at `inode`. Split fragments may sit
/// in either half of their slot pair; full fragments sit exactly where the
/// inode says.
pub(crate) fn fetch_fragment(
    backend: &Backend,
    geom: Geometry,
    vnode: Vnode,
    inode: Inode,
    split: bool,
) -> Option<Vec<u8>> {
    debug_assert!(inode >= 0 && (inode as usize) < 2 * geom.total_blocks);
    let pair = fetch_slot(backend, geom, inode as usize / 2);

    if split {
        pair.iter().find_map(|blk| match blk.half() {
            BlockHalf::Split(map) => map.get(&vnode).cloned(),
            _ => None,
        })
    } else {
        match &pair[inode as usize % 2].half {
            BlockHalf::Full(owner, data) if *owner == vnode => Some(data.clone()),
            _ => None,
        }
    }
}
