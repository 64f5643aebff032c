//! Versioned binary snapshots of the kernel entity graph.
//!
//! # Stream layout
//!
//! ```text
//! [magic u32][format version u32][clock u64]
//! [ref counts u32 x 8]
//! [config frame]
//! [count u32][frame]*    materials, resources, areas, connectors,
//!                        activities, lots, inventories, batches, blocks
//! ```
//!
//! Every entity is framed as `[type id u16][version u32][len u32][payload]`
//! (little endian). Payloads are `bitcode` encodings of per-layout wire
//! structs. References between entities are written as positions in their
//! collection, so a snapshot never depends on arena slot layout.
//!
//! # Version history
//!
//! - v1: initial layout.
//! - v2: `Lot.tags`, `StorageArea.cleanout`.
//! - v3: storage span on activities and block times, `Lot.uses`.

use crate::activity::{
    Activity, ActivityState, OpenUsage, OutputSpec, Placement, ResourceRequirement, UsageTarget, WaitReason,
};
use crate::block::{Batch, Block, BlockTimes, Spans};
use crate::fixed::{Quantity, Ticks};
use crate::id::*;
use crate::kernel::Kernel;
use crate::material::{Draw, Inventory, Lot, MaterialDef, MaterialRequirement, TransferPolicy, Usability};
use crate::reservation::{ReservationBook, Resource, ResourceKind};
use crate::sim::KernelConfig;
use crate::storage::{Flow, StorageArea, StorageAreaConnector, TankState, Usage, UsageLedger};
use crate::time::Window;
use crate::versioning::DecodeTable;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a kernel snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0xBA7C_F10E;

/// Current format version.
pub const FORMAT_VERSION: u32 = 3;

/// Oldest format version this build reads.
pub const MIN_FORMAT_VERSION: u32 = 1;

/// Bytes of `[type id][version][len]` ahead of every payload.
pub const FRAME_HEADER_LEN: usize = 10;

/// Stable entity type identifiers.
pub mod type_ids {
    pub const LOT: u16 = 1;
    pub const INVENTORY: u16 = 2;
    pub const STORAGE_AREA: u16 = 3;
    pub const CONNECTOR: u16 = 4;
    pub const RESOURCE: u16 = 5;
    pub const BLOCK: u16 = 6;
    pub const BATCH: u16 = 7;
    pub const ACTIVITY: u16 = 8;
    pub const KERNEL_CONFIG: u16 = 9;
    pub const MATERIAL: u16 = 10;

    pub fn is_known(id: u16) -> bool {
        (LOT..=MATERIAL).contains(&id)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
    #[error("format version {0} is outside {MIN_FORMAT_VERSION}..={FORMAT_VERSION} or predates the entity")]
    VersionOutOfRange(u32),
    #[error("reference to a {0} that is not part of the snapshot")]
    DanglingRef(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("data too short")]
    TooShort,
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unknown entity type id {0}")]
    UnknownTypeId(u16),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("expected entity type {expected}, found {found}")]
    TypeMismatch { expected: u16, found: u16 },
    #[error("decoding failed: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after the last entity")]
    TrailingBytes(usize),
    #[error("{kind} reference {index} is out of range")]
    DanglingRef { kind: &'static str, index: u32 },
}

// ---------------------------------------------------------------------------
// Byte cursor
// ---------------------------------------------------------------------------

/// Append-only little-endian writer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian reader over a byte slice.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DeserializeError> {
        let end = self.pos.checked_add(n).ok_or(DeserializeError::TooShort)?;
        let bytes = self.data.get(self.pos..end).ok_or(DeserializeError::TooShort)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn get_u16(&mut self) -> Result<u16, DeserializeError> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(b))
    }

    pub fn get_u32(&mut self) -> Result<u32, DeserializeError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    pub fn get_u64(&mut self) -> Result<u64, DeserializeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail if any bytes are left unread.
    pub fn finish(self) -> Result<(), DeserializeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DeserializeError::TrailingBytes(n)),
        }
    }
}

// ---------------------------------------------------------------------------
// Reference tables
// ---------------------------------------------------------------------------

macro_rules! ref_tables {
    ($($field:ident / $method:ident : $key:ty => $kind:literal),* $(,)?) => {
        /// Arena keys to collection positions, for writing.
        #[derive(Debug, Default)]
        pub struct RefEncoder {
            $(pub(crate) $field: BTreeMap<$key, u32>,)*
        }

        /// Collection positions to arena keys, for reading.
        #[derive(Debug, Default)]
        pub struct RefDecoder {
            $(pub(crate) $field: Vec<$key>,)*
        }

        impl RefEncoder {
            $(
                pub fn $method(&self, key: $key) -> Result<u32, SerializeError> {
                    self.$field.get(&key).copied().ok_or(SerializeError::DanglingRef($kind))
                }
            )*

            fn counts(&self) -> Vec<u32> {
                vec![$(self.$field.len() as u32),*]
            }
        }

        impl RefDecoder {
            $(
                pub fn $method(&self, index: u32) -> Result<$key, DeserializeError> {
                    self.$field
                        .get(index as usize)
                        .copied()
                        .ok_or(DeserializeError::DanglingRef { kind: $kind, index })
                }
            )*

            /// The keys a fresh arena hands out for `counts` insertions.
            fn allocate(counts: &[u32]) -> Self {
                let mut counts = counts.iter().copied();
                Self {
                    $($field: fresh_keys(counts.next().unwrap_or(0)),)*
                }
            }
        }
    };
}

ref_tables! {
    activities / activity: ActivityId => "activity",
    resources / resource: ResourceId => "resource",
    lots / lot: LotId => "lot",
    inventories / inventory: InventoryId => "inventory",
    areas / area: StorageAreaId => "storage area",
    connectors / connector: ConnectorId => "connector",
    blocks / block: BlockId => "block",
    batches / batch: BatchId => "batch",
}

/// Number of reference kinds in a snapshot.
pub const REF_KINDS: usize = 8;

fn fresh_keys<K: slotmap::Key>(n: u32) -> Vec<K> {
    let mut arena = SlotMap::<K, ()>::with_key();
    (0..n).map(|_| arena.insert(())).collect()
}

fn positions<K: Ord>(keys: impl IntoIterator<Item = K>) -> BTreeMap<K, u32> {
    keys.into_iter().enumerate().map(|(i, k)| (k, i as u32)).collect()
}

impl RefEncoder {
    /// Positions of every entity in the order `Kernel::encode_at` writes
    /// them.
    pub fn for_kernel(kernel: &Kernel) -> Self {
        Self {
            activities: positions(kernel.activities().map(|(id, _)| id)),
            resources: positions(kernel.resources.keys()),
            lots: positions(kernel.lots().map(|(id, _)| id)),
            inventories: positions(kernel.inventories.keys()),
            areas: positions(kernel.areas.keys()),
            connectors: positions(kernel.connectors.keys()),
            blocks: positions(kernel.blocks.keys()),
            batches: positions(kernel.batches.keys()),
        }
    }
}

impl RefDecoder {
    /// Decoder matching the arenas of `kernel`, which must not have had
    /// entities removed.
    pub fn for_kernel(kernel: &Kernel) -> Self {
        Self::allocate(&RefEncoder::for_kernel(kernel).counts())
    }
}

// ---------------------------------------------------------------------------
// Versioned entities and framing
// ---------------------------------------------------------------------------

/// An entity with a stable type id and version-gated layouts.
pub trait Versioned: Sized {
    const TYPE_ID: u16;
    /// Format version the entity first appeared in.
    const INTRODUCED_IN: u32;

    /// Encode the layout in force at `version`.
    fn encode_payload(&self, version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError>;

    /// Decoders for every layout, keyed by introducing version.
    fn decode_table() -> DecodeTable<Self, RefDecoder>;

    /// The layout written at `version`.
    fn layout(version: u32) -> Result<u32, SerializeError> {
        if version < Self::INTRODUCED_IN || version > FORMAT_VERSION {
            return Err(SerializeError::VersionOutOfRange(version));
        }
        Self::decode_table()
            .layout_for(version)
            .ok_or(SerializeError::VersionOutOfRange(version))
    }
}

fn to_wire<W: Serialize>(wire: &W) -> Result<Vec<u8>, SerializeError> {
    bitcode::serialize(wire).map_err(|e| SerializeError::Encode(e.to_string()))
}

fn from_wire<W: DeserializeOwned>(bytes: &[u8]) -> Result<W, DeserializeError> {
    bitcode::deserialize(bytes).map_err(|e| DeserializeError::Decode(e.to_string()))
}

pub fn write_frame<T: Versioned>(
    w: &mut Writer,
    item: &T,
    version: u32,
    refs: &RefEncoder,
) -> Result<(), SerializeError> {
    T::layout(version)?;
    let payload = item.encode_payload(version, refs)?;
    w.put_u16(T::TYPE_ID);
    w.put_u32(version);
    w.put_u32(payload.len() as u32);
    w.put_bytes(&payload);
    Ok(())
}

/// Read one frame of type `T` from a stream stamped `stream_version`.
pub fn read_frame<T: Versioned>(
    r: &mut Reader<'_>,
    stream_version: u32,
    refs: &RefDecoder,
) -> Result<T, DeserializeError> {
    let type_id = r.get_u16()?;
    if !type_ids::is_known(type_id) {
        return Err(DeserializeError::UnknownTypeId(type_id));
    }
    if type_id != T::TYPE_ID {
        return Err(DeserializeError::TypeMismatch {
            expected: T::TYPE_ID,
            found: type_id,
        });
    }
    let version = r.get_u32()?;
    if version > FORMAT_VERSION {
        return Err(DeserializeError::FutureVersion(version));
    }
    if version > stream_version {
        return Err(DeserializeError::Decode(format!(
            "frame version {version} is newer than stream version {stream_version}"
        )));
    }
    if version < T::INTRODUCED_IN {
        return Err(DeserializeError::UnsupportedVersion(version));
    }
    let len = r.get_u32()? as usize;
    let payload = r.take(len)?;
    T::decode_table().decode(version, payload, refs)
}

pub fn write_collection<'a, T: Versioned + 'a>(
    w: &mut Writer,
    items: impl IntoIterator<Item = &'a T>,
    version: u32,
    refs: &RefEncoder,
) -> Result<(), SerializeError> {
    let items: Vec<&T> = items.into_iter().collect();
    w.put_u32(items.len() as u32);
    for item in items {
        write_frame(w, item, version, refs)?;
    }
    Ok(())
}

pub fn read_collection<T: Versioned>(
    r: &mut Reader<'_>,
    stream_version: u32,
    refs: &RefDecoder,
) -> Result<Vec<T>, DeserializeError> {
    let count = r.get_u32()? as usize;
    if count.saturating_mul(FRAME_HEADER_LEN) > r.remaining() {
        return Err(DeserializeError::TooShort);
    }
    (0..count).map(|_| read_frame(r, stream_version, refs)).collect()
}

/// Encode a single entity as one frame.
pub fn encode_entity<T: Versioned>(item: &T, version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
    let mut w = Writer::new();
    write_frame(&mut w, item, version, refs)?;
    Ok(w.into_bytes())
}

/// Decode a single frame. The bytes must hold exactly one entity.
pub fn decode_entity<T: Versioned>(bytes: &[u8], refs: &RefDecoder) -> Result<T, DeserializeError> {
    let mut r = Reader::new(bytes);
    let item = read_frame(&mut r, FORMAT_VERSION, refs)?;
    r.finish()?;
    Ok(item)
}

// ---------------------------------------------------------------------------
// Shared wire pieces
// ---------------------------------------------------------------------------

fn q(v: Quantity) -> i64 {
    v.to_bits()
}

fn unq(bits: i64) -> Quantity {
    Quantity::from_bits(bits)
}

fn window_wire(w: Window) -> (u64, u64) {
    (w.start, w.end)
}

fn unwindow((start, end): (u64, u64)) -> Window {
    Window::new(start, end)
}

/// Block times without the storage span.
fn times_v1(t: &BlockTimes) -> [u64; 5] {
    [t.start, t.setup_end, t.processing_end, t.post_processing_end, t.clean_end]
}

/// Rebuild block times; layouts before v3 end storage at clean-end.
fn untimes(t: [u64; 5], storage_end: Option<u64>) -> Result<BlockTimes, DeserializeError> {
    BlockTimes::new(t[0], t[1], t[2], t[3], t[4], storage_end.unwrap_or(t[4]))
        .map_err(|e| DeserializeError::Decode(e.to_string()))
}

#[derive(Serialize, Deserialize)]
enum TransferWire {
    AtCompletion,
    Incremental(u64),
}

impl From<TransferPolicy> for TransferWire {
    fn from(t: TransferPolicy) -> Self {
        match t {
            TransferPolicy::AtCompletion => TransferWire::AtCompletion,
            TransferPolicy::Incremental { step } => TransferWire::Incremental(step),
        }
    }
}

impl From<TransferWire> for TransferPolicy {
    fn from(t: TransferWire) -> Self {
        match t {
            TransferWire::AtCompletion => TransferPolicy::AtCompletion,
            TransferWire::Incremental(step) => TransferPolicy::Incremental { step },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct UsageWire {
    window: (u64, u64),
    quantity: i64,
    inflow: bool,
    activity: u32,
}

impl UsageWire {
    fn new(u: &Usage, refs: &RefEncoder) -> Result<Self, SerializeError> {
        Ok(Self {
            window: window_wire(u.window),
            quantity: q(u.quantity),
            inflow: u.flow == Flow::Inflow,
            activity: refs.activity(u.activity)?,
        })
    }

    fn into_usage(self, refs: &RefDecoder) -> Result<Usage, DeserializeError> {
        Ok(Usage {
            window: unwindow(self.window),
            quantity: unq(self.quantity),
            flow: if self.inflow { Flow::Inflow } else { Flow::Outflow },
            activity: refs.activity(self.activity)?,
        })
    }
}

fn usages_wire(ledger: &UsageLedger, refs: &RefEncoder) -> Result<Vec<UsageWire>, SerializeError> {
    ledger.usages().iter().map(|u| UsageWire::new(u, refs)).collect()
}

fn unledger(capacity: i64, usages: Vec<UsageWire>, refs: &RefDecoder) -> Result<UsageLedger, DeserializeError> {
    let usages = usages
        .into_iter()
        .map(|u| u.into_usage(refs))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(UsageLedger::from_usages(unq(capacity), usages))
}

// ---------------------------------------------------------------------------
// KernelConfig & MaterialDef
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct ConfigV1 {
    planning_horizon: u64,
    horizon_extension: Option<u64>,
    max_horizon_extensions: u32,
    dispatch_log_capacity: u64,
    max_dispatches: Option<u64>,
}

fn decode_config_v1(bytes: &[u8], _: &RefDecoder) -> Result<KernelConfig, DeserializeError> {
    let w: ConfigV1 = from_wire(bytes)?;
    Ok(KernelConfig {
        planning_horizon: w.planning_horizon,
        horizon_extension: w.horizon_extension,
        max_horizon_extensions: w.max_horizon_extensions,
        dispatch_log_capacity: w.dispatch_log_capacity as usize,
        max_dispatches: w.max_dispatches,
    })
}

impl Versioned for KernelConfig {
    const TYPE_ID: u16 = type_ids::KERNEL_CONFIG;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, _version: u32, _refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        to_wire(&ConfigV1 {
            planning_horizon: self.planning_horizon,
            horizon_extension: self.horizon_extension,
            max_horizon_extensions: self.max_horizon_extensions,
            dispatch_log_capacity: self.dispatch_log_capacity as u64,
            max_dispatches: self.max_dispatches,
        })
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new().with(1, decode_config_v1)
    }
}

#[derive(Serialize, Deserialize)]
struct MaterialV1 {
    name: String,
    shelf_life: Option<u64>,
    transfer: TransferWire,
}

fn decode_material_v1(bytes: &[u8], _: &RefDecoder) -> Result<MaterialDef, DeserializeError> {
    let w: MaterialV1 = from_wire(bytes)?;
    Ok(MaterialDef {
        name: w.name,
        shelf_life: w.shelf_life,
        transfer: w.transfer.into(),
    })
}

impl Versioned for MaterialDef {
    const TYPE_ID: u16 = type_ids::MATERIAL;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, _version: u32, _refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        to_wire(&MaterialV1 {
            name: self.name.clone(),
            shelf_life: self.shelf_life,
            transfer: self.transfer.into(),
        })
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new().with(1, decode_material_v1)
    }
}

// ---------------------------------------------------------------------------
// Lot
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct LotV1 {
    code: String,
    material: u32,
    total: i64,
    consumed: i64,
    produced_at: u64,
    flow: (u64, u64),
    transfer: TransferWire,
    expires_at: Option<u64>,
    location: Option<u32>,
    producer: Option<u32>,
    expired: bool,
}

#[derive(Serialize, Deserialize)]
struct LotV2 {
    base: LotV1,
    tags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct LotV3 {
    base: LotV2,
    uses: u32,
}

impl LotV1 {
    fn new(lot: &Lot, refs: &RefEncoder) -> Result<Self, SerializeError> {
        Ok(Self {
            code: lot.code.0.clone(),
            material: lot.material.0,
            total: q(lot.total),
            consumed: q(lot.consumed),
            produced_at: lot.produced_at,
            flow: window_wire(lot.flow),
            transfer: lot.transfer.into(),
            expires_at: lot.expires_at,
            location: lot.location.map(|a| refs.area(a)).transpose()?,
            producer: lot.producer.map(|a| refs.activity(a)).transpose()?,
            expired: lot.expired,
        })
    }

    fn into_lot(self, refs: &RefDecoder) -> Result<Lot, DeserializeError> {
        let mut lot = Lot::on_hand(self.code, MaterialId(self.material), unq(self.total), self.produced_at);
        lot.consumed = unq(self.consumed);
        lot.flow = unwindow(self.flow);
        lot.transfer = self.transfer.into();
        lot.expires_at = self.expires_at;
        lot.location = self.location.map(|a| refs.area(a)).transpose()?;
        lot.producer = self.producer.map(|a| refs.activity(a)).transpose()?;
        lot.expired = self.expired;
        Ok(lot)
    }
}

impl LotV2 {
    fn into_lot(self, refs: &RefDecoder) -> Result<Lot, DeserializeError> {
        let mut lot = self.base.into_lot(refs)?;
        lot.tags = self.tags.into_iter().collect();
        Ok(lot)
    }
}

fn decode_lot_v1(bytes: &[u8], refs: &RefDecoder) -> Result<Lot, DeserializeError> {
    from_wire::<LotV1>(bytes)?.into_lot(refs)
}

fn decode_lot_v2(bytes: &[u8], refs: &RefDecoder) -> Result<Lot, DeserializeError> {
    from_wire::<LotV2>(bytes)?.into_lot(refs)
}

fn decode_lot_v3(bytes: &[u8], refs: &RefDecoder) -> Result<Lot, DeserializeError> {
    let w: LotV3 = from_wire(bytes)?;
    let mut lot = w.base.into_lot(refs)?;
    lot.uses = w.uses;
    Ok(lot)
}

impl Versioned for Lot {
    const TYPE_ID: u16 = type_ids::LOT;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        let base = LotV1::new(self, refs)?;
        let tags = || self.tags.iter().cloned().collect();
        match Self::layout(version)? {
            1 => to_wire(&base),
            2 => to_wire(&LotV2 { base, tags: tags() }),
            _ => to_wire(&LotV3 {
                base: LotV2 { base, tags: tags() },
                uses: self.uses,
            }),
        }
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new()
            .with(1, decode_lot_v1)
            .with(2, decode_lot_v2)
            .with(3, decode_lot_v3)
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct InventoryV1 {
    storage: u32,
    lot: u32,
    material: u32,
    produced_at: u64,
    expires_at: Option<u64>,
}

fn decode_inventory_v1(bytes: &[u8], refs: &RefDecoder) -> Result<Inventory, DeserializeError> {
    let w: InventoryV1 = from_wire(bytes)?;
    let inventory = Inventory {
        storage: refs.area(w.storage)?,
        lot: refs.lot(w.lot)?,
        material: MaterialId(w.material),
        produced_at: w.produced_at,
        expires_at: w.expires_at,
    };
    if inventory.expires_at.is_some_and(|e| e < inventory.produced_at) {
        return Err(DeserializeError::Decode("inventory expires before it is produced".into()));
    }
    Ok(inventory)
}

impl Versioned for Inventory {
    const TYPE_ID: u16 = type_ids::INVENTORY;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, _version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        to_wire(&InventoryV1 {
            storage: refs.area(self.storage)?,
            lot: refs.lot(self.lot)?,
            material: self.material.0,
            produced_at: self.produced_at,
            expires_at: self.expires_at,
        })
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new().with(1, decode_inventory_v1)
    }
}

// ---------------------------------------------------------------------------
// StorageArea & connector
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
enum TankWire {
    Empty,
    Holding(u32),
    Cleaning(u64),
}

#[derive(Serialize, Deserialize)]
struct AreaV1 {
    name: String,
    capacity: i64,
    usages: Vec<UsageWire>,
    tank: Option<TankWire>,
}

#[derive(Serialize, Deserialize)]
struct AreaV2 {
    base: AreaV1,
    cleanout: u64,
}

impl AreaV1 {
    fn new(area: &StorageArea, refs: &RefEncoder) -> Result<Self, SerializeError> {
        let tank = match area.tank {
            None => None,
            Some(TankState::Empty) => Some(TankWire::Empty),
            Some(TankState::Holding(inv)) => Some(TankWire::Holding(refs.inventory(inv)?)),
            Some(TankState::Cleaning { until }) => Some(TankWire::Cleaning(until)),
        };
        Ok(Self {
            name: area.name.clone(),
            capacity: q(area.ledger.capacity),
            usages: usages_wire(&area.ledger, refs)?,
            tank,
        })
    }

    fn into_area(self, refs: &RefDecoder) -> Result<StorageArea, DeserializeError> {
        let tank = match self.tank {
            None => None,
            Some(TankWire::Empty) => Some(TankState::Empty),
            Some(TankWire::Holding(inv)) => Some(TankState::Holding(refs.inventory(inv)?)),
            Some(TankWire::Cleaning(until)) => Some(TankState::Cleaning { until }),
        };
        Ok(StorageArea {
            name: self.name,
            ledger: unledger(self.capacity, self.usages, refs)?,
            tank,
            cleanout: 0,
        })
    }
}

fn decode_area_v1(bytes: &[u8], refs: &RefDecoder) -> Result<StorageArea, DeserializeError> {
    from_wire::<AreaV1>(bytes)?.into_area(refs)
}

fn decode_area_v2(bytes: &[u8], refs: &RefDecoder) -> Result<StorageArea, DeserializeError> {
    let w: AreaV2 = from_wire(bytes)?;
    let mut area = w.base.into_area(refs)?;
    area.cleanout = w.cleanout;
    Ok(area)
}

impl Versioned for StorageArea {
    const TYPE_ID: u16 = type_ids::STORAGE_AREA;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        let base = AreaV1::new(self, refs)?;
        match Self::layout(version)? {
            1 => to_wire(&base),
            _ => to_wire(&AreaV2 {
                base,
                cleanout: self.cleanout,
            }),
        }
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new().with(1, decode_area_v1).with(2, decode_area_v2)
    }
}

#[derive(Serialize, Deserialize)]
struct ConnectorV1 {
    name: String,
    from: Option<u32>,
    to: Option<u32>,
    capacity: i64,
    usages: Vec<UsageWire>,
}

fn decode_connector_v1(bytes: &[u8], refs: &RefDecoder) -> Result<StorageAreaConnector, DeserializeError> {
    let w: ConnectorV1 = from_wire(bytes)?;
    Ok(StorageAreaConnector {
        name: w.name,
        from: w.from.map(|a| refs.area(a)).transpose()?,
        to: w.to.map(|a| refs.area(a)).transpose()?,
        ledger: unledger(w.capacity, w.usages, refs)?,
    })
}

impl Versioned for StorageAreaConnector {
    const TYPE_ID: u16 = type_ids::CONNECTOR;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, _version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        to_wire(&ConnectorV1 {
            name: self.name.clone(),
            from: self.from.map(|a| refs.area(a)).transpose()?,
            to: self.to.map(|a| refs.area(a)).transpose()?,
            capacity: q(self.ledger.capacity),
            usages: usages_wire(&self.ledger, refs)?,
        })
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new().with(1, decode_connector_v1)
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
enum KindWire {
    Single,
    Multitasking(u32),
}

#[derive(Serialize, Deserialize)]
struct ResourceV1 {
    name: String,
    kind: KindWire,
    book: Vec<(u64, u64, u32)>,
}

fn decode_resource_v1(bytes: &[u8], refs: &RefDecoder) -> Result<Resource, DeserializeError> {
    let w: ResourceV1 = from_wire(bytes)?;
    let windows = w
        .book
        .into_iter()
        .map(|(start, end, owner)| Ok((Window::new(start, end), refs.batch(owner)?)))
        .collect::<Result<Vec<_>, DeserializeError>>()?;
    let book = ReservationBook::from_windows(windows);
    if !book.is_consistent() {
        return Err(DeserializeError::Decode(format!(
            "resource {} has overlapping reservations",
            w.name
        )));
    }
    let kind = match w.kind {
        KindWire::Single => ResourceKind::Single,
        KindWire::Multitasking(capacity) => ResourceKind::Multitasking { capacity },
    };
    Ok(Resource {
        name: w.name,
        kind,
        book,
    })
}

impl Versioned for Resource {
    const TYPE_ID: u16 = type_ids::RESOURCE;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, _version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        let book = self
            .book
            .iter()
            .map(|(w, owner)| Ok((w.start, w.end, refs.batch(owner)?)))
            .collect::<Result<Vec<_>, SerializeError>>()?;
        to_wire(&ResourceV1 {
            name: self.name.clone(),
            kind: match self.kind {
                ResourceKind::Single => KindWire::Single,
                ResourceKind::Multitasking { capacity } => KindWire::Multitasking(capacity),
            },
            book,
        })
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new().with(1, decode_resource_v1)
    }
}

// ---------------------------------------------------------------------------
// Block & Batch
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct BlockV1 {
    activity: u32,
    resource: u32,
    batch: u32,
    times: [u64; 5],
}

#[derive(Serialize, Deserialize)]
struct BlockV3 {
    base: BlockV1,
    storage_end: u64,
}

fn block_from(w: BlockV1, storage_end: Option<u64>, refs: &RefDecoder) -> Result<Block, DeserializeError> {
    Ok(Block {
        activity: refs.activity(w.activity)?,
        resource: refs.resource(w.resource)?,
        batch: refs.batch(w.batch)?,
        times: untimes(w.times, storage_end)?,
    })
}

fn decode_block_v1(bytes: &[u8], refs: &RefDecoder) -> Result<Block, DeserializeError> {
    block_from(from_wire(bytes)?, None, refs)
}

fn decode_block_v3(bytes: &[u8], refs: &RefDecoder) -> Result<Block, DeserializeError> {
    let w: BlockV3 = from_wire(bytes)?;
    block_from(w.base, Some(w.storage_end), refs)
}

impl Versioned for Block {
    const TYPE_ID: u16 = type_ids::BLOCK;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        let base = BlockV1 {
            activity: refs.activity(self.activity)?,
            resource: refs.resource(self.resource)?,
            batch: refs.batch(self.batch)?,
            times: times_v1(&self.times),
        };
        match Self::layout(version)? {
            1 => to_wire(&base),
            _ => to_wire(&BlockV3 {
                base,
                storage_end: self.times.storage_end,
            }),
        }
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new().with(1, decode_block_v1).with(3, decode_block_v3)
    }
}

#[derive(Serialize, Deserialize)]
struct BatchV1 {
    resource: u32,
    times: [u64; 5],
    window: (u64, u64),
    blocks: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct BatchV3 {
    base: BatchV1,
    storage_end: u64,
}

fn batch_from(w: BatchV1, storage_end: Option<u64>, refs: &RefDecoder) -> Result<Batch, DeserializeError> {
    let mut batch = Batch::new(
        refs.resource(w.resource)?,
        untimes(w.times, storage_end)?,
        unwindow(w.window),
    );
    batch.blocks = w
        .blocks
        .into_iter()
        .map(|b| refs.block(b))
        .collect::<Result<_, _>>()?;
    Ok(batch)
}

fn decode_batch_v1(bytes: &[u8], refs: &RefDecoder) -> Result<Batch, DeserializeError> {
    batch_from(from_wire(bytes)?, None, refs)
}

fn decode_batch_v3(bytes: &[u8], refs: &RefDecoder) -> Result<Batch, DeserializeError> {
    let w: BatchV3 = from_wire(bytes)?;
    batch_from(w.base, Some(w.storage_end), refs)
}

impl Versioned for Batch {
    const TYPE_ID: u16 = type_ids::BATCH;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        let base = BatchV1 {
            resource: refs.resource(self.resource)?,
            times: times_v1(&self.times),
            window: window_wire(self.window),
            blocks: self
                .blocks
                .iter()
                .map(|b| refs.block(*b))
                .collect::<Result<_, _>>()?,
        };
        match Self::layout(version)? {
            1 => to_wire(&base),
            _ => to_wire(&BatchV3 {
                base,
                storage_end: self.times.storage_end,
            }),
        }
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new().with(1, decode_batch_v1).with(3, decode_batch_v3)
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// An activity together with its committed placement, as stored in a
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedActivity {
    pub activity: Activity,
    pub placement: Option<Placement>,
}

#[derive(Serialize, Deserialize)]
struct RequirementWire {
    candidates: Vec<u32>,
    assigned: Option<u32>,
}

#[derive(Serialize, Deserialize)]
enum UsabilityWire {
    Wear(u32),
    ShelfLife {
        min_remaining: u64,
        eligible: Option<Vec<String>>,
    },
}

#[derive(Serialize, Deserialize)]
struct DemandWire {
    material: u32,
    quantity: i64,
    usability: UsabilityWire,
    required_tags: Vec<String>,
    source: Option<u32>,
    connector: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct OutputWire {
    material: u32,
    quantity: i64,
    storage: Option<u32>,
    connector: Option<u32>,
    tags: Vec<String>,
}

#[derive(Serialize, Deserialize)]
enum WaitWire {
    Resource(u32, u64),
    Batch(u32),
    Material(u32),
    StorageArea(u32),
    Connector(u32, u64),
}

#[derive(Serialize, Deserialize)]
enum StateWire {
    Pending,
    Waiting(WaitWire),
    Placed,
    Unplaceable(String),
}

#[derive(Serialize, Deserialize)]
enum TargetWire {
    Area(u32),
    Connector(u32),
}

#[derive(Serialize, Deserialize)]
struct PlacementV1 {
    times: [u64; 5],
    blocks: Vec<u32>,
    draws: Vec<(u32, i64)>,
    usages: Vec<(TargetWire, UsageWire)>,
    output_lot: Option<u32>,
    inventory: Option<u32>,
    emptied: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct ActivityV1 {
    key: (u32, u32, u32),
    name: String,
    release: u64,
    /// setup, run, post-processing, clean
    spans: [u64; 4],
    resources: Vec<RequirementWire>,
    materials: Vec<DemandWire>,
    output: Option<OutputWire>,
    state: StateWire,
    attempts: u32,
    placement: Option<PlacementV1>,
}

#[derive(Serialize, Deserialize)]
struct ActivityV3 {
    base: ActivityV1,
    storage_span: u64,
    placement_storage_end: Option<u64>,
}

fn wait_wire(reason: &WaitReason, refs: &RefEncoder) -> Result<WaitWire, SerializeError> {
    Ok(match *reason {
        WaitReason::Resource { resource, until } => WaitWire::Resource(refs.resource(resource)?, until),
        WaitReason::Batch(batch) => WaitWire::Batch(refs.batch(batch)?),
        WaitReason::Material(material) => WaitWire::Material(material.0),
        WaitReason::StorageArea(area) => WaitWire::StorageArea(refs.area(area)?),
        WaitReason::Connector { connector, until } => WaitWire::Connector(refs.connector(connector)?, until),
    })
}

fn unwait(w: WaitWire, refs: &RefDecoder) -> Result<WaitReason, DeserializeError> {
    Ok(match w {
        WaitWire::Resource(r, until) => WaitReason::Resource {
            resource: refs.resource(r)?,
            until,
        },
        WaitWire::Batch(b) => WaitReason::Batch(refs.batch(b)?),
        WaitWire::Material(m) => WaitReason::Material(MaterialId(m)),
        WaitWire::StorageArea(a) => WaitReason::StorageArea(refs.area(a)?),
        WaitWire::Connector(c, until) => WaitReason::Connector {
            connector: refs.connector(c)?,
            until,
        },
    })
}

fn placement_wire(p: &Placement, refs: &RefEncoder) -> Result<PlacementV1, SerializeError> {
    let usages = p
        .usages
        .iter()
        .map(|open| {
            let target = match open.target {
                UsageTarget::Area(a) => TargetWire::Area(refs.area(a)?),
                UsageTarget::Connector(c) => TargetWire::Connector(refs.connector(c)?),
            };
            Ok((target, UsageWire::new(&open.usage, refs)?))
        })
        .collect::<Result<Vec<_>, SerializeError>>()?;
    Ok(PlacementV1 {
        times: times_v1(&p.times),
        blocks: p.blocks.iter().map(|b| refs.block(*b)).collect::<Result<_, _>>()?,
        draws: p
            .draws
            .iter()
            .map(|d| Ok((refs.lot(d.lot)?, q(d.quantity))))
            .collect::<Result<_, SerializeError>>()?,
        usages,
        output_lot: p.output_lot.map(|l| refs.lot(l)).transpose()?,
        // The output inventory is gone once its lot is drawn out.
        inventory: p.inventory.and_then(|i| refs.inventory(i).ok()),
        emptied: p.emptied.iter().map(|l| refs.lot(*l)).collect::<Result<_, _>>()?,
    })
}

fn unplacement(w: PlacementV1, storage_end: Option<u64>, refs: &RefDecoder) -> Result<Placement, DeserializeError> {
    let usages = w
        .usages
        .into_iter()
        .map(|(target, usage)| {
            let target = match target {
                TargetWire::Area(a) => UsageTarget::Area(refs.area(a)?),
                TargetWire::Connector(c) => UsageTarget::Connector(refs.connector(c)?),
            };
            Ok(OpenUsage {
                target,
                usage: usage.into_usage(refs)?,
            })
        })
        .collect::<Result<Vec<_>, DeserializeError>>()?;
    Ok(Placement {
        times: untimes(w.times, storage_end)?,
        blocks: w.blocks.into_iter().map(|b| refs.block(b)).collect::<Result<_, _>>()?,
        draws: w
            .draws
            .into_iter()
            .map(|(lot, qty)| {
                Ok(Draw {
                    lot: refs.lot(lot)?,
                    quantity: unq(qty),
                })
            })
            .collect::<Result<_, DeserializeError>>()?,
        usages,
        output_lot: w.output_lot.map(|l| refs.lot(l)).transpose()?,
        inventory: w.inventory.map(|i| refs.inventory(i)).transpose()?,
        emptied: w.emptied.into_iter().map(|l| refs.lot(l)).collect::<Result<_, _>>()?,
    })
}

impl ActivityV1 {
    fn new(placed: &PlacedActivity, refs: &RefEncoder) -> Result<Self, SerializeError> {
        let a = &placed.activity;
        let resources = a
            .resources
            .iter()
            .map(|req| {
                Ok(RequirementWire {
                    candidates: req
                        .candidates
                        .iter()
                        .map(|r| refs.resource(*r))
                        .collect::<Result<_, _>>()?,
                    assigned: req.assigned.map(|r| refs.resource(r)).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, SerializeError>>()?;
        let materials = a
            .materials
            .iter()
            .map(|req| {
                Ok(DemandWire {
                    material: req.material.0,
                    quantity: q(req.quantity),
                    usability: match &req.usability {
                        Usability::Wear { max_uses } => UsabilityWire::Wear(*max_uses),
                        Usability::ShelfLife {
                            min_remaining,
                            eligible,
                        } => UsabilityWire::ShelfLife {
                            min_remaining: *min_remaining,
                            eligible: eligible
                                .as_ref()
                                .map(|set| set.iter().map(|c| c.0.clone()).collect()),
                        },
                    },
                    required_tags: req.required_tags.iter().cloned().collect(),
                    source: req.source.map(|s| refs.area(s)).transpose()?,
                    connector: req.connector.map(|c| refs.connector(c)).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, SerializeError>>()?;
        let output = a
            .output
            .as_ref()
            .map(|out| {
                Ok(OutputWire {
                    material: out.material.0,
                    quantity: q(out.quantity),
                    storage: out.storage.map(|s| refs.area(s)).transpose()?,
                    connector: out.connector.map(|c| refs.connector(c)).transpose()?,
                    tags: out.tags.iter().cloned().collect(),
                })
            })
            .transpose()?;
        let state = match &a.state {
            ActivityState::Pending => StateWire::Pending,
            // A wait on a batch that has since been undone reloads as
            // pending; restored kernels re-attempt pending work.
            ActivityState::Waiting(reason) => match wait_wire(reason, refs) {
                Ok(w) => StateWire::Waiting(w),
                Err(_) => StateWire::Pending,
            },
            ActivityState::Placed => StateWire::Placed,
            ActivityState::Unplaceable(reason) => StateWire::Unplaceable(reason.clone()),
        };
        Ok(Self {
            key: (a.key.job.0, a.key.order.0, a.key.operation.0),
            name: a.name.clone(),
            release: a.release,
            spans: [a.spans.setup, a.spans.run, a.spans.post_processing, a.spans.clean],
            resources,
            materials,
            output,
            state,
            attempts: a.attempts,
            placement: placed.placement.as_ref().map(|p| placement_wire(p, refs)).transpose()?,
        })
    }

    fn into_placed(
        self,
        storage_span: u64,
        placement_storage_end: Option<u64>,
        refs: &RefDecoder,
    ) -> Result<PlacedActivity, DeserializeError> {
        let [setup, run, post_processing, clean] = self.spans;
        let mut a = Activity::new(
            ActivityKey::new(self.key.0, self.key.1, self.key.2),
            self.name,
            Spans::new(setup, run, post_processing, clean, storage_span),
        );
        a.release = self.release;
        a.resources = self
            .resources
            .into_iter()
            .map(|req| {
                Ok(ResourceRequirement {
                    candidates: req
                        .candidates
                        .into_iter()
                        .map(|r| refs.resource(r))
                        .collect::<Result<_, _>>()?,
                    assigned: req.assigned.map(|r| refs.resource(r)).transpose()?,
                })
            })
            .collect::<Result<_, DeserializeError>>()?;
        a.materials = self
            .materials
            .into_iter()
            .map(|d| {
                let usability = match d.usability {
                    UsabilityWire::Wear(max_uses) => Usability::Wear { max_uses },
                    UsabilityWire::ShelfLife {
                        min_remaining,
                        eligible,
                    } => Usability::ShelfLife {
                        min_remaining,
                        eligible: eligible.map(|codes| codes.into_iter().map(LotCode).collect()),
                    },
                };
                Ok(MaterialRequirement {
                    material: MaterialId(d.material),
                    quantity: unq(d.quantity),
                    usability,
                    required_tags: d.required_tags.into_iter().collect(),
                    source: d.source.map(|s| refs.area(s)).transpose()?,
                    connector: d.connector.map(|c| refs.connector(c)).transpose()?,
                })
            })
            .collect::<Result<_, DeserializeError>>()?;
        a.output = self
            .output
            .map(|o| {
                Ok::<_, DeserializeError>(OutputSpec {
                    material: MaterialId(o.material),
                    quantity: unq(o.quantity),
                    storage: o.storage.map(|s| refs.area(s)).transpose()?,
                    connector: o.connector.map(|c| refs.connector(c)).transpose()?,
                    tags: o.tags.into_iter().collect(),
                })
            })
            .transpose()?;
        a.state = match self.state {
            StateWire::Pending => ActivityState::Pending,
            StateWire::Waiting(w) => ActivityState::Waiting(unwait(w, refs)?),
            StateWire::Placed => ActivityState::Placed,
            StateWire::Unplaceable(reason) => ActivityState::Unplaceable(reason),
        };
        a.attempts = self.attempts;
        let placement = self
            .placement
            .map(|p| unplacement(p, placement_storage_end, refs))
            .transpose()?;
        if a.is_placed() != placement.is_some() {
            return Err(DeserializeError::Decode(format!(
                "activity {} placement does not match its state",
                a.key
            )));
        }
        Ok(PlacedActivity { activity: a, placement })
    }
}

fn decode_activity_v1(bytes: &[u8], refs: &RefDecoder) -> Result<PlacedActivity, DeserializeError> {
    let w: ActivityV1 = from_wire(bytes)?;
    w.into_placed(0, None, refs)
}

fn decode_activity_v3(bytes: &[u8], refs: &RefDecoder) -> Result<PlacedActivity, DeserializeError> {
    let w: ActivityV3 = from_wire(bytes)?;
    w.base.into_placed(w.storage_span, w.placement_storage_end, refs)
}

impl Versioned for PlacedActivity {
    const TYPE_ID: u16 = type_ids::ACTIVITY;
    const INTRODUCED_IN: u32 = 1;

    fn encode_payload(&self, version: u32, refs: &RefEncoder) -> Result<Vec<u8>, SerializeError> {
        let base = ActivityV1::new(self, refs)?;
        match Self::layout(version)? {
            1 => to_wire(&base),
            _ => to_wire(&ActivityV3 {
                base,
                storage_span: self.activity.spans.storage,
                placement_storage_end: self.placement.as_ref().map(|p| p.times.storage_end),
            }),
        }
    }

    fn decode_table() -> DecodeTable<Self, RefDecoder> {
        DecodeTable::new()
            .with(1, decode_activity_v1)
            .with(3, decode_activity_v3)
    }
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Fixed header at the start of every kernel snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Kernel clock when the snapshot was taken.
    pub clock: Ticks,
}

impl SnapshotHeader {
    pub fn new(version: u32, clock: Ticks) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version,
            clock,
        }
    }

    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < MIN_FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    fn write(&self, w: &mut Writer) {
        w.put_u32(self.magic);
        w.put_u32(self.version);
        w.put_u64(self.clock);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DeserializeError> {
        let header = Self {
            magic: r.get_u32()?,
            version: r.get_u32()?,
            clock: r.get_u64()?,
        };
        header.validate()?;
        Ok(header)
    }
}

/// Read and validate only the header of a snapshot.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    SnapshotHeader::read(&mut Reader::new(data))
}

// ---------------------------------------------------------------------------
// Kernel snapshots
// ---------------------------------------------------------------------------

fn insert_all<K: slotmap::Key, V>(
    arena: &mut SlotMap<K, V>,
    items: Vec<V>,
    keys: &[K],
    kind: &str,
) -> Result<(), DeserializeError> {
    if items.len() != keys.len() {
        return Err(DeserializeError::Decode(format!(
            "expected {} {kind} entities, found {}",
            keys.len(),
            items.len()
        )));
    }
    for (item, &expected) in items.into_iter().zip(keys) {
        if arena.insert(item) != expected {
            return Err(DeserializeError::Decode(format!("{kind} keys diverged while rebuilding")));
        }
    }
    Ok(())
}

impl Kernel {
    /// Encode the entity graph at the current format version.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializeError> {
        self.encode_at(FORMAT_VERSION)
    }

    /// Encode the entity graph with the layouts of an older format version.
    /// Fields introduced after `version` are dropped.
    pub fn encode_at(&self, version: u32) -> Result<Vec<u8>, SerializeError> {
        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
            return Err(SerializeError::VersionOutOfRange(version));
        }
        let refs = RefEncoder::for_kernel(self);
        let mut w = Writer::new();
        SnapshotHeader::new(version, self.clock).write(&mut w);
        for count in refs.counts() {
            w.put_u32(count);
        }

        write_frame(&mut w, &self.config, version, &refs)?;
        write_collection(&mut w, &self.materials, version, &refs)?;
        write_collection(&mut w, self.resources.values(), version, &refs)?;
        write_collection(&mut w, self.areas.values(), version, &refs)?;
        write_collection(&mut w, self.connectors.values(), version, &refs)?;
        let activities: Vec<PlacedActivity> = self
            .activities()
            .map(|(id, a)| PlacedActivity {
                activity: a.clone(),
                placement: self.placements.get(id).cloned(),
            })
            .collect();
        write_collection(&mut w, &activities, version, &refs)?;
        write_collection(&mut w, self.lots().map(|(_, l)| l), version, &refs)?;
        write_collection(&mut w, self.inventories.values(), version, &refs)?;
        write_collection(&mut w, self.batches.values(), version, &refs)?;
        write_collection(&mut w, self.blocks.values(), version, &refs)?;
        Ok(w.into_bytes())
    }

    /// Rebuild a kernel from a snapshot. Arena keys are re-created in
    /// snapshot order; the queue starts empty and is re-seeded by the next
    /// run.
    pub fn from_bytes(data: &[u8]) -> Result<Kernel, DeserializeError> {
        let mut r = Reader::new(data);
        let header = SnapshotHeader::read(&mut r)?;
        let version = header.version;
        let mut counts = [0u32; REF_KINDS];
        for count in &mut counts {
            *count = r.get_u32()?;
        }
        let total: usize = counts.iter().map(|c| *c as usize).sum();
        if total.saturating_mul(FRAME_HEADER_LEN) > r.remaining() {
            return Err(DeserializeError::TooShort);
        }
        let refs = RefDecoder::allocate(&counts);

        let config: KernelConfig = read_frame(&mut r, version, &refs)?;
        let materials: Vec<MaterialDef> = read_collection(&mut r, version, &refs)?;
        let resources: Vec<Resource> = read_collection(&mut r, version, &refs)?;
        let areas: Vec<StorageArea> = read_collection(&mut r, version, &refs)?;
        let connectors: Vec<StorageAreaConnector> = read_collection(&mut r, version, &refs)?;
        let activities: Vec<PlacedActivity> = read_collection(&mut r, version, &refs)?;
        let lots: Vec<Lot> = read_collection(&mut r, version, &refs)?;
        let inventories: Vec<Inventory> = read_collection(&mut r, version, &refs)?;
        let batches: Vec<Batch> = read_collection(&mut r, version, &refs)?;
        let blocks: Vec<Block> = read_collection(&mut r, version, &refs)?;
        r.finish()?;

        let mut kernel = Kernel::new(config);
        kernel.clock = header.clock;
        kernel.materials = materials;
        insert_all(&mut kernel.resources, resources, &refs.resources, "resource")?;
        insert_all(&mut kernel.areas, areas, &refs.areas, "storage area")?;
        insert_all(&mut kernel.connectors, connectors, &refs.connectors, "connector")?;
        insert_all(&mut kernel.lots, lots, &refs.lots, "lot")?;
        insert_all(&mut kernel.inventories, inventories, &refs.inventories, "inventory")?;
        insert_all(&mut kernel.batches, batches, &refs.batches, "batch")?;
        insert_all(&mut kernel.blocks, blocks, &refs.blocks, "block")?;

        let mut plain = Vec::with_capacity(activities.len());
        let mut placements = Vec::new();
        for (placed, &id) in activities.into_iter().zip(&refs.activities) {
            if kernel.activity_keys.insert(placed.activity.key, id).is_some() {
                return Err(DeserializeError::Decode(format!(
                    "duplicate activity {}",
                    placed.activity.key
                )));
            }
            if let Some(p) = placed.placement {
                placements.push((id, p));
            }
            plain.push(placed.activity);
        }
        insert_all(&mut kernel.activities, plain, &refs.activities, "activity")?;
        for (id, placement) in placements {
            kernel.placements.insert(id, placement);
        }
        kernel.activity_order = refs.activities.clone();
        kernel.lot_order = refs.lots.clone();
        for material in kernel.lots.values().map(|l| l.material) {
            if material.0 as usize >= kernel.materials.len() {
                return Err(DeserializeError::Decode(format!("lot of unknown material {}", material.0)));
            }
        }
        Ok(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::OutputSpec;
    use crate::fixed::units;
    use crate::test_utils::*;

    fn sample_kernel() -> Kernel {
        let mut k = Kernel::default();
        let flour = k.add_material(MaterialDef::new("flour").with_shelf_life(500));
        let dough = k.add_material(MaterialDef::new("dough"));
        let silo = k.add_area(StorageArea::tank("silo", units(100), 5));
        let mixer = k.add_resource(Resource::single("mixer"));
        k.add_lot(Lot::on_hand("F1", flour, units(50), 0).at(silo).with_tag("organic"))
            .unwrap();
        let mix = Activity::new(key(1, 1, 10), "mix", Spans::new(2, 10, 1, 1, 3))
            .requires(ResourceRequirement::on(mixer))
            .consumes(MaterialRequirement::new(flour, units(20)).from_area(silo))
            .produces(OutputSpec::new(dough, units(20)).with_tag("batch-a"));
        k.add_activity(mix).unwrap();
        k
    }

    #[test]
    fn header_rejects_bad_magic_and_versions() {
        let mut w = Writer::new();
        SnapshotHeader {
            magic: 0xDEAD_BEEF,
            version: FORMAT_VERSION,
            clock: 0,
        }
        .write(&mut w);
        assert!(matches!(
            read_snapshot_header(&w.into_bytes()),
            Err(DeserializeError::InvalidMagic(0xDEAD_BEEF))
        ));

        let mut w = Writer::new();
        SnapshotHeader::new(FORMAT_VERSION + 1, 0).write(&mut w);
        assert!(matches!(
            read_snapshot_header(&w.into_bytes()),
            Err(DeserializeError::FutureVersion(v)) if v == FORMAT_VERSION + 1
        ));

        let mut w = Writer::new();
        SnapshotHeader::new(0, 0).write(&mut w);
        assert!(matches!(
            read_snapshot_header(&w.into_bytes()),
            Err(DeserializeError::UnsupportedVersion(0))
        ));

        assert!(matches!(read_snapshot_header(&[1, 2, 3]), Err(DeserializeError::TooShort)));
    }

    #[test]
    fn lot_round_trips_at_every_version() {
        let k = sample_kernel();
        let enc = RefEncoder::for_kernel(&k);
        let dec = RefDecoder::for_kernel(&k);
        let (_, lot) = k.lots().next().unwrap();
        let mut lot = lot.clone();
        lot.consumed = units(5);
        lot.uses = 1;

        let current = decode_entity::<Lot>(&encode_entity(&lot, 3, &enc).unwrap(), &dec).unwrap();
        assert_eq!(current, lot);

        let v2 = decode_entity::<Lot>(&encode_entity(&lot, 2, &enc).unwrap(), &dec).unwrap();
        assert_eq!(v2.tags, lot.tags);
        assert_eq!(v2.uses(), 0);

        let v1 = decode_entity::<Lot>(&encode_entity(&lot, 1, &enc).unwrap(), &dec).unwrap();
        assert!(v1.tags.is_empty());
        assert_eq!(v1.consumed(), units(5));
        assert_eq!(v1.code, lot.code);
    }

    #[test]
    fn area_cleanout_defaults_below_v2() {
        let k = sample_kernel();
        let enc = RefEncoder::for_kernel(&k);
        let dec = RefDecoder::for_kernel(&k);
        let (_, area) = k.areas().next().unwrap();

        let v1 = decode_entity::<StorageArea>(&encode_entity(area, 1, &enc).unwrap(), &dec).unwrap();
        assert_eq!(v1.cleanout, 0);
        assert_eq!(v1.tank, area.tank);

        let v2 = decode_entity::<StorageArea>(&encode_entity(area, 2, &enc).unwrap(), &dec).unwrap();
        assert_eq!(&v2, area);
    }

    #[test]
    fn activity_storage_span_defaults_below_v3() {
        let k = sample_kernel();
        let enc = RefEncoder::for_kernel(&k);
        let dec = RefDecoder::for_kernel(&k);
        let (_, a) = k.activities().next().unwrap();
        let placed = PlacedActivity {
            activity: a.clone(),
            placement: None,
        };

        let v3 = decode_entity::<PlacedActivity>(&encode_entity(&placed, 3, &enc).unwrap(), &dec).unwrap();
        assert_eq!(v3, placed);

        let v2 = decode_entity::<PlacedActivity>(&encode_entity(&placed, 2, &enc).unwrap(), &dec).unwrap();
        assert_eq!(v2.activity.spans.storage, 0);
        assert_eq!(v2.activity.spans.run, placed.activity.spans.run);
    }

    #[test]
    fn frame_type_checks() {
        let k = sample_kernel();
        let enc = RefEncoder::for_kernel(&k);
        let dec = RefDecoder::for_kernel(&k);
        let bytes = encode_entity(&k.config().clone(), FORMAT_VERSION, &enc).unwrap();

        assert!(matches!(
            decode_entity::<Lot>(&bytes, &dec),
            Err(DeserializeError::TypeMismatch {
                expected: type_ids::LOT,
                found: type_ids::KERNEL_CONFIG
            })
        ));

        let mut unknown = bytes.clone();
        unknown[0..2].copy_from_slice(&999u16.to_le_bytes());
        assert!(matches!(
            decode_entity::<KernelConfig>(&unknown, &dec),
            Err(DeserializeError::UnknownTypeId(999))
        ));

        let mut future = bytes.clone();
        future[2..6].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        assert!(matches!(
            decode_entity::<KernelConfig>(&future, &dec),
            Err(DeserializeError::FutureVersion(_))
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(
            decode_entity::<KernelConfig>(&trailing, &dec),
            Err(DeserializeError::TrailingBytes(1))
        ));

        assert!(matches!(
            decode_entity::<KernelConfig>(&bytes[..bytes.len() - 1], &dec),
            Err(DeserializeError::TooShort)
        ));
    }

    #[test]
    fn encoding_before_introduction_or_after_current_fails() {
        let k = sample_kernel();
        let enc = RefEncoder::for_kernel(&k);
        assert!(matches!(
            encode_entity(k.config(), 0, &enc),
            Err(SerializeError::VersionOutOfRange(0))
        ));
        assert!(matches!(
            k.encode_at(FORMAT_VERSION + 1),
            Err(SerializeError::VersionOutOfRange(_))
        ));
    }

    #[test]
    fn kernel_snapshot_round_trips_after_a_run() {
        let mut k = sample_kernel();
        let report = k.run();
        assert_eq!(report.outcome, crate::sim::RunOutcome::Exhausted);

        let bytes = k.to_bytes().unwrap();
        let restored = Kernel::from_bytes(&bytes).unwrap();
        assert_eq!(restored.clock(), k.clock());
        assert_eq!(restored.state_hash(), k.state_hash());
        assert_eq!(restored.to_bytes().unwrap(), bytes);

        let (id, _) = restored.activities().next().unwrap();
        let placement = restored.placement(id).unwrap();
        assert_eq!(placement.times.storage_end - placement.times.clean_end, 3);
        assert_eq!(restored.blocks().count(), 1);
    }

    #[test]
    fn older_snapshot_loads_with_defaults() {
        let mut k = sample_kernel();
        k.run();
        let restored = Kernel::from_bytes(&k.encode_at(1).unwrap()).unwrap();

        let (id, a) = restored.activities().next().unwrap();
        assert_eq!(a.spans.storage, 0);
        let p = restored.placement(id).unwrap();
        assert_eq!(p.times.storage_end, p.times.clean_end);
        assert!(restored.lots().all(|(_, l)| l.tags.is_empty() && l.uses() == 0));
        assert!(restored.areas().all(|(_, a)| a.cleanout == 0));
    }

    #[test]
    fn truncated_or_padded_snapshot_is_rejected() {
        let mut k = sample_kernel();
        k.run();
        let bytes = k.to_bytes().unwrap();
        assert!(Kernel::from_bytes(&bytes[..bytes.len() - 3]).is_err());

        let mut padded = bytes.clone();
        padded.extend_from_slice(&[0, 0]);
        assert!(matches!(
            Kernel::from_bytes(&padded),
            Err(DeserializeError::TrailingBytes(2))
        ));
    }
}
