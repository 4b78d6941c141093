#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use o2_core::alttp::UPDATE_SLOT_A;
use o2_core::game::{FrameOutput, Game, GameOptions, ReadRequest, WriteRequest};
use o2_core::notify::NotificationBus;
use o2_core::payload::PayloadWriter;

const SCRATCH_END: u32 = 0x70_8000;

/// WRAM plus the scratch area the update routines live in. Nothing is
/// executed; tests play the console's part with [`Console::run_routine`].
pub struct Console {
    pub wram: Vec<u8>,
    pub scratch: Vec<u8>,
}

impl Console {
    /// A console standing on the overworld.
    pub fn new() -> Self {
        let mut wram = vec![0; 0x1_0000];
        wram[0x10] = 0x09;
        Self {
            wram,
            scratch: vec![0; (SCRATCH_END - UPDATE_SLOT_A) as usize],
        }
    }

    pub fn set_sram(&mut self, offset: usize, value: u8) {
        self.wram[0xF000 + offset] = value;
    }

    fn fulfill(&self, reads: &[ReadRequest]) -> Vec<(ReadRequest, Vec<u8>)> {
        reads
            .iter()
            .map(|r| {
                let data = if (0x7E_0000..0x7F_0000).contains(&r.address) {
                    let start = (r.address - 0x7E_0000) as usize;
                    self.wram[start..start + r.size].to_vec()
                } else {
                    let start = (r.address - UPDATE_SLOT_A) as usize;
                    self.scratch[start..start + r.size].to_vec()
                };
                (*r, data)
            })
            .collect()
    }

    fn write(&mut self, writes: &[WriteRequest]) {
        for w in writes {
            let start = (w.address - UPDATE_SLOT_A) as usize;
            self.scratch[start..start + w.data.len()].copy_from_slice(&w.data);
        }
    }

    /// Marks the routine at `base` as run, with the given confirmation bytes.
    pub fn run_routine(&mut self, base: u32, confirmations: &[u8]) {
        let start = (base - UPDATE_SLOT_A) as usize;
        self.scratch[start] = 0x60;
        self.scratch[start + 2..start + 2 + confirmations.len()].copy_from_slice(confirmations);
    }
}

/// One frame: advance the frame counter, read, and accept any writes.
pub fn cycle(game: &mut Game, console: &mut Console, now_ms: u32) -> FrameOutput {
    console.wram[0x1A] = console.wram[0x1A].wrapping_add(1);
    let reads = game.main_reads();
    let out = game.complete_reads(&console.fulfill(&reads), now_ms);
    if !out.writes.is_empty() {
        console.write(&out.writes);
        game.routine_written(true);
    }
    out
}

pub fn game_with_recorder() -> (Game, Arc<Mutex<Vec<String>>>) {
    let bus = Arc::new(NotificationBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(move |s| sink.lock().unwrap().push(s.to_string()));
    let game = Game::new("me", 0, GameOptions::default(), bus).unwrap();
    (game, seen)
}

pub fn payload(frame: u8, build: impl FnOnce(&mut PayloadWriter)) -> Vec<u8> {
    let mut w = PayloadWriter::new(0, frame);
    build(&mut w);
    w.finish()
}
