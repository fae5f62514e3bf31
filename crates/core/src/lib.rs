//! # ardusim-core
//!
//! Cycle-accurate simulation core for the Arduboy handheld: an ATmega32u4
//! microcontroller with 16 MHz clock, 32 KiB flash, 2.5 KiB SRAM and 1 KiB
//! EEPROM, wired to an SSD1306 128×64 OLED over SPI and a 16 MiB W25Q128
//! "FX" external flash sharing the same bus.
//!
//! ## Architecture
//!
//! - [`Arduboy`] — top-level board: per-cycle coordination of CPU, SPI
//!   routing, display/FX timing, profiler accounting, and save capture
//! - [`Cpu`] — AVR core: decoded program tables, data space with per-address
//!   peripheral handlers, cycle stepping, interrupt dispatch
//! - [`Ssd1306`] — display controller: command parser, GDDRAM, row-refresh
//!   pixel integrator with vsync events
//! - [`peripherals`] — Timer0/1/3, SPI, EEPROM, ADC, PLL, sound, FX flash
//! - [`Profiler`] — per-address cycle counts and hotspot reconstruction
//! - [`savedata`] — game-hash-scoped EEPROM + FX sector persistence
//!
//! The caller owns the pacing: [`Arduboy::advance`] consumes a picosecond
//! budget and [`Arduboy::advance_instr`] single-steps. Everything else
//! (window, input mapping, audio resampling, ELF parsing) lives outside the
//! core behind byte-stream and table interfaces.

pub mod cpu;
pub mod disasm;
pub mod display;
pub mod opcodes;
pub mod peripherals;
pub mod profiler;
pub mod savedata;
pub mod symbols;

pub use cpu::Cpu;
pub use display::{Ssd1306, SCREEN_HEIGHT, SCREEN_WIDTH};
pub use profiler::{Hotspot, Profiler};
pub use savedata::SaveData;
pub use symbols::{Symbol, SymbolTable};

use log::debug;
use peripherals::fx_flash::{FxFlash, NUM_SECTORS, SECTOR_SIZE};
use savedata::{fnv1a_64, FNV_OFFSET};

// ATmega32u4 geometry
/// Flash size: 32 KiB.
pub const PROG_SIZE: usize = 32 * 1024;
/// Flash size in 16-bit words.
pub const PROG_WORDS: usize = PROG_SIZE / 2;
/// Data space: registers + I/O + 2.5 KiB SRAM.
pub const DATA_SIZE: usize = 32 + 224 + 2 * 1024 + 512;
/// EEPROM size: 1 KiB.
pub const EEPROM_SIZE: usize = 1024;
/// CPU clock frequency.
pub const CLOCK_HZ: u32 = 16_000_000;

/// Picoseconds per CPU cycle at 16 MHz.
pub const CYCLE_PS: u64 = 62_500;
/// Smallest advance quantum; budgets below this carry over to the next call.
pub const PS_BUFFER: u64 = 4 * CYCLE_PS;

// SREG bit positions
pub const SREG_C: u8 = 0;
pub const SREG_Z: u8 = 1;
pub const SREG_N: u8 = 2;
pub const SREG_V: u8 = 3;
pub const SREG_S: u8 = 4;
pub const SREG_H: u8 = 5;
pub const SREG_T: u8 = 6;
pub const SREG_I: u8 = 7;

// Memory-mapped core registers (data space addresses)
pub const SREG_ADDR: u16 = 0x5F;
pub const SPH_ADDR: u16 = 0x5E;
pub const SPL_ADDR: u16 = 0x5D;

/// Arduboy button identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
    A,
    B,
}

/// Top-level board: CPU, display, and FX flash stepped in lock-step.
pub struct Arduboy {
    pub cpu: Cpu,
    pub display: Ssd1306,
    pub fx: FxFlash,
    pub profiler: Profiler,
    /// Pre-parsed text symbols for profiler hotspot grouping.
    pub symbols: Option<SymbolTable>,

    pub savedata: SaveData,
    /// EEPROM or FX sectors changed since the last save flush was emitted.
    pub savedata_dirty: bool,
    /// FNV-1a-64 over program + FX image; scopes the save record.
    pub game_hash: u64,

    /// Set when a breakpoint, step target, or stack overflow stops execution.
    pub paused: bool,
    /// Execution breakpoints, one per program word.
    pub breakpoints: Box<[bool]>,
    /// Data-space read breakpoints.
    pub breakpoints_rd: Box<[bool]>,
    /// Data-space write breakpoints.
    pub breakpoints_wr: Box<[bool]>,
    /// Master switch for the three breakpoint sets (the step target always
    /// applies).
    pub allow_nonstep_breakpoints: bool,
    /// Single-step target: pause when PC reaches this word address.
    pub break_step: Option<u16>,

    /// Declared logical frame size in display-data bytes; 0 disables the
    /// synthetic vsync and uses the physical refresh instead.
    pub frame_bytes_total: u32,
    frame_bytes: u32,

    ps_rem: u64,
}

impl Arduboy {
    pub fn new() -> Self {
        Arduboy {
            cpu: Cpu::new(),
            display: Ssd1306::new(),
            fx: FxFlash::new(),
            profiler: Profiler::new(),
            symbols: None,
            savedata: SaveData::default(),
            savedata_dirty: false,
            game_hash: 0,
            paused: false,
            breakpoints: vec![false; PROG_WORDS].into_boxed_slice(),
            breakpoints_rd: vec![false; DATA_SIZE].into_boxed_slice(),
            breakpoints_wr: vec![false; DATA_SIZE].into_boxed_slice(),
            allow_nonstep_breakpoints: true,
            break_step: None,
            frame_bytes_total: 0,
            frame_bytes: 0,
            ps_rem: 0,
        }
    }

    /// Load a flash image and reset to power-on state.
    pub fn load_program(&mut self, image: &[u8]) {
        self.cpu.load_program(image);
        self.update_game_hash();
        self.reset();
    }

    /// Load an FX flash image (up to 16 MiB).
    pub fn load_fx_data(&mut self, bin: &[u8]) {
        self.fx.load_data(bin);
        self.update_game_hash();
    }

    fn update_game_hash(&mut self) {
        let h = fnv1a_64(FNV_OFFSET, &self.cpu.prog[..]);
        self.game_hash = fnv1a_64(h, &self.fx.data);
    }

    /// Reset CPU, display, FX chip state, profiler, and frame history.
    /// Flash, FX data, EEPROM, and breakpoints are preserved.
    pub fn reset(&mut self) {
        self.profiler.reset();
        self.cpu.reset();
        self.display.reset();
        self.fx.reset();
        self.paused = false;
        self.break_step = None;
        self.frame_bytes = 0;
        self.ps_rem = 0;
        if self.breakpoints[0] {
            self.paused = true;
        }
    }

    /// Set button state (true = pressed). Buttons are active-low:
    /// UP=PF7, DOWN=PF4, LEFT=PF5, RIGHT=PF6, A=PE6, B=PB4.
    pub fn set_button(&mut self, btn: Button, pressed: bool) {
        let (pin, bit): (&mut u8, u8) = match btn {
            Button::Up => (&mut self.cpu.pin_f, 7),
            Button::Down => (&mut self.cpu.pin_f, 4),
            Button::Left => (&mut self.cpu.pin_f, 5),
            Button::Right => (&mut self.cpu.pin_f, 6),
            Button::A => (&mut self.cpu.pin_e, 6),
            Button::B => (&mut self.cpu.pin_b, 4),
        };
        if pressed {
            *pin &= !(1 << bit);
        } else {
            *pin |= 1 << bit;
        }
    }

    /// Filtered per-pixel intensities (row-major, 128×64).
    pub fn pixels(&self) -> &[f32] {
        &self.display.pixels[..]
    }

    /// Format a register dump with R0-R31, PC, SP, SREG, and pointer regs.
    pub fn dump_regs(&self) -> String {
        let mut s = String::new();
        for i in 0..32 {
            if i % 8 == 0 && i > 0 {
                s.push('\n');
            }
            s.push_str(&format!("R{:2}={:02X} ", i, self.cpu.data[i]));
        }
        s.push_str(&format!(
            "\nPC={:04X} SP={:04X} SREG={} (0x{:02X})",
            self.cpu.pc * 2,
            self.cpu.sp(),
            disasm::format_sreg(self.cpu.sreg()),
            self.cpu.sreg()
        ));
        s.push_str(&format!(
            "\nX={:04X} Y={:04X} Z={:04X}",
            self.cpu.x(),
            self.cpu.y(),
            self.cpu.z()
        ));
        s
    }

    /// One board step: CPU tick, SPI routing, display/FX time, profiler and
    /// vsync bookkeeping. Returns the system cycles consumed.
    fn cycle(&mut self) -> u32 {
        let mut vsync = false;
        let portd = self.cpu.data[0x2B];
        let cycles = self.cpu.advance_cycle();

        self.fx.set_enabled(portd & (1 << 1) == 0);

        if self.cpu.spi_done_shifting {
            let byte = self.cpu.spi_data_byte;

            // display selected?
            if portd & (1 << 6) == 0 {
                if portd & (1 << 4) != 0 {
                    if self.frame_bytes_total != 0 {
                        self.frame_bytes += 1;
                        if self.frame_bytes >= self.frame_bytes_total {
                            self.frame_bytes = 0;
                            vsync = true;
                        }
                    }
                    self.display.send_data(byte);
                } else {
                    self.display.send_command(byte);
                }
            }

            // the FX chip shares the bus and drives MISO
            let response = self.fx.spi_transceive(byte);
            self.cpu.set_spi_datain(response);
            self.cpu.spi_done_shifting = false;
        }

        let awake = self.cpu.active || self.cpu.wakeup_cycles != 0;
        self.profiler
            .record_cycles(self.cpu.executing_instr_pc, cycles as u64, awake);

        let ps = cycles as u64 * CYCLE_PS;
        let physical_vsync = self.display.advance(ps);
        self.fx.advance(ps);

        if self.frame_bytes_total == 0 {
            vsync |= physical_vsync;
        }
        if vsync {
            self.profiler.frame_boundary();
        }

        cycles
    }

    /// Step exactly one instruction (or until an interrupt moves the PC),
    /// then pause.
    pub fn advance_instr(&mut self) {
        if !self.cpu.decoded {
            return;
        }
        let old_pc = self.cpu.pc;
        self.ps_rem = 0;
        let mut n = 0;
        loop {
            self.paused = false;
            self.cycle();
            self.cpu.update_all();
            self.paused = true;
            n += 1;
            if n >= 65536 || self.cpu.pc != old_pc {
                break;
            }
        }
    }

    /// Run until the picosecond budget is exhausted, a breakpoint or step
    /// target fires, or a stack overflow pauses execution. Sub-quantum
    /// remainders carry into the next call so cross-call time does not drift.
    pub fn advance(&mut self, ps: u64) {
        let mut ps = ps + self.ps_rem;
        self.ps_rem = 0;

        if !self.cpu.decoded || self.paused {
            return;
        }

        let any_breakpoints = (self.allow_nonstep_breakpoints
            && (self.breakpoints.iter().any(|&b| b)
                || self.breakpoints_rd.iter().any(|&b| b)
                || self.breakpoints_wr.iter().any(|&b| b)))
            || self.break_step.is_some();

        self.cpu.stack_overflow = false;

        while ps >= PS_BUFFER {
            let cycles = self.cycle();
            ps = ps.saturating_sub(cycles as u64 * CYCLE_PS);

            if any_breakpoints {
                let pc = self.cpu.pc;
                let hit = Some(pc) == self.break_step
                    || (self.allow_nonstep_breakpoints
                        && (self.breakpoints[pc as usize]
                            || self
                                .cpu
                                .just_read
                                .is_some_and(|a| (a as usize) < DATA_SIZE
                                    && self.breakpoints_rd[a as usize])
                            || self
                                .cpu
                                .just_written
                                .is_some_and(|a| (a as usize) < DATA_SIZE
                                    && self.breakpoints_wr[a as usize])));
                if hit {
                    debug!("paused at breakpoint, pc=0x{:04X}", pc * 2);
                    self.paused = true;
                    break;
                }
            }

            if self.cpu.stack_overflow && self.cpu.enable_stack_break {
                debug!("paused on stack overflow, sp=0x{:04X}", self.cpu.sp());
                self.paused = true;
                break;
            }
        }

        self.cpu.update_all();

        if !self.paused {
            self.ps_rem = ps;
        }

        if !self.display.enable_filter {
            self.display.mirror_raw();
        }

        self.flush_savedata();
    }

    /// Fold EEPROM and modified FX sectors into the save record.
    fn flush_savedata(&mut self) {
        if self.cpu.eeprom_dirty {
            self.savedata.eeprom = self.cpu.eeprom.clone();
            self.cpu.eeprom_dirty = false;
            self.savedata_dirty = true;
        }
        if self.fx.sectors_dirty {
            for sector in self.fx.modified_sectors() {
                let start = sector * SECTOR_SIZE;
                self.savedata
                    .fx_sectors
                    .insert(sector as u32, self.fx.data[start..start + SECTOR_SIZE].to_vec());
            }
            self.fx.sectors_dirty = false;
            self.savedata_dirty = true;
        }
    }

    /// Rehydrate the save record from a byte stream. A record whose game
    /// hash does not match the loaded images is discarded silently.
    pub fn load_savedata(&mut self, r: &mut impl std::io::Read) -> Result<(), String> {
        let loaded = savedata::read_savedata(r)?;
        if loaded.game_hash != self.game_hash {
            debug!(
                "save record is for another game (0x{:016X} != 0x{:016X}), ignored",
                loaded.game_hash, self.game_hash
            );
            self.savedata.clear();
            return Ok(());
        }
        self.savedata = loaded;

        if self.savedata.eeprom.len() == self.cpu.eeprom.len() {
            self.cpu.eeprom.copy_from_slice(&self.savedata.eeprom);
        }
        for (&sector, bytes) in &self.savedata.fx_sectors {
            if sector as usize >= NUM_SECTORS || bytes.len() != SECTOR_SIZE {
                continue;
            }
            self.fx.load_data_at(bytes, sector as usize * SECTOR_SIZE);
        }
        Ok(())
    }

    /// Emit the save record if anything changed since the last flush.
    pub fn save_savedata(&mut self, w: &mut impl std::io::Write) -> Result<(), String> {
        if !self.savedata_dirty {
            return Ok(());
        }
        self.savedata.game_hash = self.game_hash;
        savedata::write_savedata(&self.savedata, w)?;
        self.savedata_dirty = false;
        Ok(())
    }
}

impl Default for Arduboy {
    fn default() -> Self {
        Self::new()
    }
}
