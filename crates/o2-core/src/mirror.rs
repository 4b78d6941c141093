//! Shadow copies of console memory, and the address spaces they live in.

use std::ops::Range;

/// Start of cartridge SRAM in device (flash cart) address space.
pub const PAK_SRAM: u32 = 0xE0_0000;
/// Start of WRAM in device address space.
pub const PAK_WRAM: u32 = 0xF5_0000;
const PAK_WRAM_END: u32 = 0xF7_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Work RAM, `$7E0000-$7FFFFF`. Readable only.
    Wram,
    /// The game's in-WRAM copy of its save data, `$7EF000-$7EF4FF`.
    Sram,
}

impl Region {
    pub const fn size(self) -> usize {
        match self {
            Region::Wram => 0x1_0000,
            Region::Sram => 0x500,
        }
    }

    pub const fn bus_base(self) -> u32 {
        match self {
            Region::Wram => 0x7E_0000,
            Region::Sram => 0x7E_F000,
        }
    }
}

/// A fixed-size copy of one console memory region.
///
/// Bytes are only trusted once something has written them; [`MemoryMirror::is_fresh`]
/// reports that per byte so strategies can ignore data a remote player never sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMirror {
    region: Region,
    data: Vec<u8>,
    fresh: Vec<bool>,
}

impl MemoryMirror {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            data: vec![0; region.size()],
            fresh: vec![false; region.size()],
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bus_address(&self, offset: u32) -> u32 {
        self.region.bus_base() + offset
    }

    pub fn read_u8(&self, offset: u32) -> u8 {
        self.data.get(offset as usize).copied().unwrap_or(0xFF)
    }

    pub fn read_u16(&self, offset: u32) -> u16 {
        let i = offset as usize;
        match self.data.get(i..i + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0xFFFF,
        }
    }

    pub fn is_fresh(&self, offset: u32, len: usize) -> bool {
        let i = offset as usize;
        self.fresh
            .get(i..i + len)
            .is_some_and(|f| f.iter().all(|&b| b))
    }

    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        let end = range.end.min(self.data.len());
        let start = range.start.min(end);
        &self.data[start..end]
    }

    /// Copies `src` in at `offset`, clipping anything past the end, and marks it fresh.
    pub fn write(&mut self, offset: usize, src: &[u8]) {
        if offset >= self.data.len() {
            return;
        }
        let n = src.len().min(self.data.len() - offset);
        self.data[offset..offset + n].copy_from_slice(&src[..n]);
        self.fresh[offset..offset + n].fill(true);
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.write(offset, &[value]);
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.fresh.fill(false);
    }
}

fn lorom_bank_to_linear(addr: u32) -> u32 {
    let bank = addr >> 16;
    let linear_bank = ((bank & 1) << 15) + ((bank >> 1) << 16);
    linear_bank + (addr & 0x7FFF)
}

/// Translates a console bus address into the device's flat address space.
///
/// SRAM banks `$70-$7D` (low half) map to [`PAK_SRAM`], WRAM banks `$7E-$7F` map
/// to [`PAK_WRAM`]. Anything else is returned unchanged.
pub fn bus_to_pak(addr: u32) -> u32 {
    if addr & 0x8000 == 0 {
        if (0x70_0000..0x7E_0000).contains(&addr) {
            return PAK_SRAM + lorom_bank_to_linear(addr - 0x70_0000);
        }
        if (0x7E_0000..0x80_0000).contains(&addr) {
            return PAK_WRAM + (addr - 0x7E_0000);
        }
    }
    addr
}

/// Offset into WRAM for a device address, if it falls inside WRAM.
pub fn pak_wram_offset(pak: u32) -> Option<usize> {
    (PAK_WRAM..PAK_WRAM_END)
        .contains(&pak)
        .then(|| (pak - PAK_WRAM) as usize)
}

pub fn is_pak_wram(pak: u32) -> bool {
    (PAK_WRAM..PAK_WRAM_END).contains(&pak)
}
