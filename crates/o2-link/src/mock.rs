//! In-process stand-in for a console, addressed in device ("pak") space.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use o2_core::alttp::{TRAMPOLINE, UPDATE_SLOT_A, UPDATE_SLOT_B};
use o2_core::confirm::EXECUTED_MARKER;
use o2_core::mirror::{bus_to_pak, is_pak_wram};

use crate::device::Device;
use crate::error::DeviceError;

#[derive(Debug, Default)]
struct Image {
    bytes: BTreeMap<u32, u8>,
    auto_execute: bool,
    closed: bool,
}

impl Image {
    fn peek(&self, address: u32, size: usize) -> Vec<u8> {
        (0..size as u32)
            .map(|i| self.bytes.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    fn poke(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(address + i as u32, *b);
        }
    }

    /// Marks the routine at `slot` as run and all of its writes as executed.
    fn execute(&mut self, slot: u32) {
        let base = bus_to_pak(slot);
        let count = self.peek(base + 1, 1)[0] as usize;
        self.poke(base + 2, &vec![1; count]);
        self.poke(base, &[EXECUTED_MARKER]);
        debug!("mock: executed routine at ${slot:06x} ({count} writes)");
    }
}

/// Sparse memory image. Unwritten bytes read as zero.
///
/// WRAM can be seeded through [`MockHandle::poke`] but never written through
/// the [`Device`] interface, the same as real hardware links.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    image: Arc<Mutex<Image>>,
}

/// Shared view of a [`MockDevice`]'s memory for tests and tooling.
#[derive(Debug, Clone)]
pub struct MockHandle {
    image: Arc<Mutex<Image>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            image: Arc::clone(&self.image),
        }
    }

    fn image(&self) -> MutexGuard<'_, Image> {
        self.image.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MockHandle {
    fn image(&self) -> MutexGuard<'_, Image> {
        self.image.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peek(&self, address: u32, size: usize) -> Vec<u8> {
        self.image().peek(address, size)
    }

    pub fn poke(&self, address: u32, data: &[u8]) {
        self.image().poke(address, data);
    }

    /// When set, a trampoline write immediately "runs" the routine it points to
    /// by stamping the executed marker and setting every confirmation byte.
    pub fn set_auto_execute(&self, on: bool) {
        self.image().auto_execute = on;
    }

    pub fn is_closed(&self) -> bool {
        self.image().closed
    }
}

impl Device for MockDevice {
    fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DeviceError> {
        let image = self.image();
        if image.closed {
            return Err(DeviceError::Closed);
        }
        trace!("mock: read ${address:06x} x{size}");
        Ok(image.peek(address, size))
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceError> {
        if is_pak_wram(address) {
            return Err(DeviceError::NotPermitted(address));
        }
        let mut image = self.image();
        if image.closed {
            return Err(DeviceError::Closed);
        }
        trace!("mock: write ${address:06x} x{}", data.len());
        image.poke(address, data);

        if image.auto_execute
            && address == bus_to_pak(TRAMPOLINE)
            && let Some(&hi) = data.first()
        {
            let slot = (UPDATE_SLOT_A & 0xFF_0000) | (u32::from(hi) << 8);
            if slot == UPDATE_SLOT_A || slot == UPDATE_SLOT_B {
                image.execute(slot);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.image().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use o2_core::mirror::PAK_WRAM;

    #[test]
    fn unwritten_memory_reads_as_zero() {
        let mut dev = MockDevice::new();
        assert_eq!(dev.read(0xE0_0000, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn wram_is_read_only_through_the_device() {
        let mut dev = MockDevice::new();
        let handle = dev.handle();
        handle.poke(PAK_WRAM + 0x10, &[0x07]);

        assert!(matches!(
            dev.write(PAK_WRAM + 0x10, &[0x09]),
            Err(DeviceError::NotPermitted(a)) if a == PAK_WRAM + 0x10
        ));
        assert_eq!(dev.read(PAK_WRAM + 0x10, 1).unwrap(), vec![0x07]);
    }

    #[test]
    fn trampoline_write_executes_when_enabled() {
        let mut dev = MockDevice::new();
        let handle = dev.handle();
        let base = bus_to_pak(UPDATE_SLOT_B);
        dev.write(base, &[0x80, 0x02, 0x00, 0x00, 0xAD]).unwrap();

        dev.write(bus_to_pak(TRAMPOLINE), &[0x7E]).unwrap();
        assert_eq!(handle.peek(base, 1), vec![0x80]);

        handle.set_auto_execute(true);
        dev.write(bus_to_pak(TRAMPOLINE), &[0x7E]).unwrap();
        assert_eq!(handle.peek(base, 5), vec![0x60, 0x02, 0x01, 0x01, 0xAD]);
    }

    #[test]
    fn closed_device_refuses_io() {
        let mut dev = MockDevice::new();
        let handle = dev.handle();
        dev.close().unwrap();
        assert!(handle.is_closed());
        assert!(matches!(dev.read(0, 1), Err(DeviceError::Closed)));
    }
}
