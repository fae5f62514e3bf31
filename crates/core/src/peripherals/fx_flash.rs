//! W25Q128-style external SPI flash ("FX" chip).
//!
//! 16 MiB backing array partitioned into 4 KiB sectors, shared on the SPI
//! bus with the display. A per-byte command state machine handles the JEDEC
//! command subset Arduboy FX firmware uses; any sector touched by a program
//! or erase is recorded in a modified-sector bitset so the board can fold it
//! into the save record.

/// Total flash capacity.
pub const FX_SIZE: usize = 16 * 1024 * 1024;
/// Erase granularity.
pub const SECTOR_SIZE: usize = 4096;
/// Number of erase sectors.
pub const NUM_SECTORS: usize = FX_SIZE / SECTOR_SIZE;

// JEDEC ID for a W25Q128 part.
const JEDEC_MFR: u8 = 0xEF;
const JEDEC_TYPE: u8 = 0x40;
const JEDEC_CAP: u8 = 0x18;

/// Typical W25Q128 page program time.
const PAGE_PROG_PS: u64 = 700_000_000;
/// Typical W25Q128 4 KiB sector erase time.
const SECTOR_ERASE_PS: u64 = 45_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FxState {
    Idle,
    ReadAddr { cmd: u8, addr_bytes: u8, addr: u32 },
    ReadDummy { addr: u32 },
    Reading { addr: u32 },
    JedecId { byte_idx: u8 },
    ReleasePd { byte_idx: u8 },
    ReadStatus,
    ProgAddr { addr_bytes: u8, addr: u32 },
    Programming { addr: u32 },
    EraseAddr { addr_bytes: u8, addr: u32 },
}

pub struct FxFlash {
    /// Backing array; allocated lazily on first load or write.
    pub data: Vec<u8>,
    pub loaded: bool,
    state: FxState,
    enabled: bool,
    write_enabled: bool,
    powered_down: bool,
    /// Picoseconds left in the current program/erase operation.
    busy_ps: u64,
    /// Sectors touched by program/erase since reset.
    sectors_modified: Vec<u64>,
    /// Any sector modified since the last save flush.
    pub sectors_dirty: bool,
}

impl FxFlash {
    pub fn new() -> Self {
        FxFlash {
            data: Vec::new(),
            loaded: false,
            state: FxState::Idle,
            enabled: false,
            write_enabled: false,
            powered_down: false,
            busy_ps: 0,
            sectors_modified: vec![0; NUM_SECTORS / 64],
            sectors_dirty: false,
        }
    }

    /// Reset transient chip state. The backing array survives (it is ROM-like
    /// game content plus saved sectors).
    pub fn reset(&mut self) {
        self.state = FxState::Idle;
        self.enabled = false;
        self.write_enabled = false;
        self.powered_down = false;
        self.busy_ps = 0;
        self.sectors_modified.iter_mut().for_each(|w| *w = 0);
        self.sectors_dirty = false;
    }

    fn ensure_data(&mut self) {
        if self.data.is_empty() {
            self.data = vec![0xFF; FX_SIZE];
        }
    }

    /// Load an FX image at the start of flash.
    pub fn load_data(&mut self, bin: &[u8]) {
        self.load_data_at(bin, 0);
    }

    /// Load an FX image at a byte offset.
    pub fn load_data_at(&mut self, bin: &[u8], offset: usize) {
        self.ensure_data();
        if offset >= FX_SIZE {
            return;
        }
        let end = (offset + bin.len()).min(FX_SIZE);
        self.data[offset..end].copy_from_slice(&bin[..end - offset]);
        self.loaded = true;
    }

    /// Chip-select update from PORTD.1 (active low). Selecting the chip
    /// resets the command state machine; deselecting it latches a pending
    /// page program.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.state = FxState::Idle;
        }
        if !enabled && self.enabled {
            if matches!(self.state, FxState::Programming { .. }) {
                self.busy_ps = PAGE_PROG_PS;
                self.write_enabled = false;
            }
            self.state = FxState::Idle;
        }
        self.enabled = enabled;
    }

    /// Consume a picosecond budget against the current program/erase
    /// operation.
    pub fn advance(&mut self, ps: u64) {
        self.busy_ps = self.busy_ps.saturating_sub(ps);
    }

    pub fn busy(&self) -> bool {
        self.busy_ps > 0
    }

    fn mark_sector(&mut self, addr: u32) {
        let sector = addr as usize / SECTOR_SIZE;
        self.sectors_modified[sector / 64] |= 1 << (sector % 64);
        self.sectors_dirty = true;
    }

    /// True when the given sector was touched since reset.
    pub fn sector_modified(&self, sector: usize) -> bool {
        sector < NUM_SECTORS && self.sectors_modified[sector / 64] & (1 << (sector % 64)) != 0
    }

    /// Indices of all sectors touched since reset.
    pub fn modified_sectors(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NUM_SECTORS).filter(move |&s| self.sector_modified(s))
    }

    /// Process one full-duplex SPI byte. Returns the byte shifted back.
    pub fn spi_transceive(&mut self, mosi: u8) -> u8 {
        if !self.enabled {
            return 0xFF;
        }
        if self.powered_down && !matches!(self.state, FxState::Idle) {
            return 0xFF;
        }
        match self.state {
            FxState::Idle => {
                // first byte after select is the command
                match mosi {
                    0xAB => {
                        self.powered_down = false;
                        self.state = FxState::ReleasePd { byte_idx: 0 };
                        return 0xFF;
                    }
                    0x05 => {
                        self.state = FxState::ReadStatus;
                        return 0xFF;
                    }
                    // a busy or powered-down chip only answers the two above
                    _ if self.powered_down || self.busy() => return 0xFF,
                    0x03 => self.state = FxState::ReadAddr { cmd: 0x03, addr_bytes: 0, addr: 0 },
                    0x0B => self.state = FxState::ReadAddr { cmd: 0x0B, addr_bytes: 0, addr: 0 },
                    0x9F => self.state = FxState::JedecId { byte_idx: 0 },
                    0x06 => self.write_enabled = true,
                    0x04 => self.write_enabled = false,
                    0x02 => self.state = FxState::ProgAddr { addr_bytes: 0, addr: 0 },
                    0x20 => self.state = FxState::EraseAddr { addr_bytes: 0, addr: 0 },
                    0xB9 => self.powered_down = true,
                    _ => {}
                }
                0xFF
            }

            FxState::ReadAddr { cmd, addr_bytes, addr } => {
                let addr = (addr << 8) | mosi as u32;
                if addr_bytes + 1 >= 3 {
                    let addr = addr & (FX_SIZE as u32 - 1);
                    self.state = if cmd == 0x0B {
                        FxState::ReadDummy { addr }
                    } else {
                        FxState::Reading { addr }
                    };
                } else {
                    self.state = FxState::ReadAddr { cmd, addr_bytes: addr_bytes + 1, addr };
                }
                0xFF
            }

            FxState::ReadDummy { addr } => {
                self.state = FxState::Reading { addr };
                0xFF
            }

            FxState::Reading { addr } => {
                let val = if self.data.is_empty() {
                    0xFF
                } else {
                    self.data[addr as usize]
                };
                self.state = FxState::Reading { addr: addr.wrapping_add(1) & (FX_SIZE as u32 - 1) };
                val
            }

            FxState::JedecId { byte_idx } => {
                let val = match byte_idx {
                    0 => JEDEC_MFR,
                    1 => JEDEC_TYPE,
                    2 => JEDEC_CAP,
                    _ => 0x00,
                };
                self.state = FxState::JedecId { byte_idx: byte_idx.saturating_add(1) };
                val
            }

            FxState::ReleasePd { byte_idx } => {
                // 3 dummy bytes then the device ID
                let val = if byte_idx >= 3 { 0x17 } else { 0xFF };
                self.state = FxState::ReleasePd { byte_idx: byte_idx.saturating_add(1) };
                val
            }

            FxState::ReadStatus => {
                ((self.write_enabled as u8) << 1) | (self.busy() as u8)
            }

            FxState::ProgAddr { addr_bytes, addr } => {
                let addr = (addr << 8) | mosi as u32;
                if addr_bytes + 1 >= 3 {
                    self.state = FxState::Programming { addr: addr & (FX_SIZE as u32 - 1) };
                } else {
                    self.state = FxState::ProgAddr { addr_bytes: addr_bytes + 1, addr };
                }
                0xFF
            }

            FxState::Programming { addr } => {
                if self.write_enabled {
                    self.ensure_data();
                    // programming only clears bits
                    self.data[addr as usize] &= mosi;
                    self.mark_sector(addr);
                    // wrap within the 256-byte page
                    let next = (addr & !0xFF) | ((addr + 1) & 0xFF);
                    self.state = FxState::Programming { addr: next };
                }
                0xFF
            }

            FxState::EraseAddr { addr_bytes, addr } => {
                let addr = (addr << 8) | mosi as u32;
                if addr_bytes + 1 >= 3 {
                    if self.write_enabled && !self.busy() {
                        self.ensure_data();
                        let start = (addr as usize & (FX_SIZE - 1)) & !(SECTOR_SIZE - 1);
                        self.data[start..start + SECTOR_SIZE].fill(0xFF);
                        self.mark_sector(start as u32);
                        self.busy_ps = SECTOR_ERASE_PS;
                    }
                    self.write_enabled = false;
                    self.state = FxState::Idle;
                } else {
                    self.state = FxState::EraseAddr { addr_bytes: addr_bytes + 1, addr };
                }
                0xFF
            }
        }
    }
}

impl Default for FxFlash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selected() -> FxFlash {
        let mut fx = FxFlash::new();
        fx.load_data(&[0x11, 0x22, 0x33, 0x44]);
        fx.set_enabled(true);
        fx
    }

    #[test]
    fn test_read_command_streams_data() {
        let mut fx = selected();
        fx.spi_transceive(0x03);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        assert_eq!(fx.spi_transceive(0xFF), 0x11);
        assert_eq!(fx.spi_transceive(0xFF), 0x22);
        assert_eq!(fx.spi_transceive(0xFF), 0x33);
        assert_eq!(fx.spi_transceive(0xFF), 0x44);
    }

    #[test]
    fn test_fast_read_has_dummy_byte() {
        let mut fx = selected();
        fx.spi_transceive(0x0B);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        assert_eq!(fx.spi_transceive(0xFF), 0xFF); // dummy
        assert_eq!(fx.spi_transceive(0xFF), 0x11);
    }

    #[test]
    fn test_jedec_id() {
        let mut fx = selected();
        fx.spi_transceive(0x9F);
        assert_eq!(fx.spi_transceive(0), 0xEF);
        assert_eq!(fx.spi_transceive(0), 0x40);
        assert_eq!(fx.spi_transceive(0), 0x18);
    }

    #[test]
    fn test_program_requires_write_enable() {
        let mut fx = selected();
        fx.spi_transceive(0x02);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        assert_eq!(fx.data[0], 0x11);
        assert!(!fx.sectors_dirty);
    }

    #[test]
    fn test_program_marks_sector() {
        let mut fx = selected();
        fx.spi_transceive(0x06); // write enable
        fx.set_enabled(false);
        fx.set_enabled(true);
        fx.spi_transceive(0x02);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x10);
        fx.spi_transceive(0x00); // addr 0x001000 = sector 1
        fx.spi_transceive(0xA5);
        assert_eq!(fx.data[0x1000], 0xA5 & 0xFF);
        assert!(fx.sector_modified(1));
        assert!(fx.sectors_dirty);
        assert_eq!(fx.modified_sectors().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_erase_fills_sector() {
        let mut fx = selected();
        fx.spi_transceive(0x06);
        fx.set_enabled(false);
        fx.set_enabled(true);
        fx.spi_transceive(0x20);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        assert_eq!(fx.data[0], 0xFF);
        assert_eq!(fx.data[3], 0xFF);
        assert!(fx.sector_modified(0));
        // status register shows busy until the erase time elapses
        fx.set_enabled(false);
        fx.set_enabled(true);
        fx.spi_transceive(0x05);
        assert_eq!(fx.spi_transceive(0) & 1, 1);
        fx.advance(SECTOR_ERASE_PS);
        assert_eq!(fx.spi_transceive(0) & 1, 0);
    }

    #[test]
    fn test_deselected_chip_is_silent() {
        let mut fx = FxFlash::new();
        fx.load_data(&[0x11]);
        fx.spi_transceive(0x03);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        fx.spi_transceive(0x00);
        assert_eq!(fx.spi_transceive(0xFF), 0xFF);
    }

    #[test]
    fn test_reselect_resets_command_state() {
        let mut fx = selected();
        fx.spi_transceive(0x03);
        fx.spi_transceive(0x00);
        fx.set_enabled(false);
        fx.set_enabled(true);
        // state machine restarted: this is a fresh command byte
        fx.spi_transceive(0x9F);
        assert_eq!(fx.spi_transceive(0), 0xEF);
    }
}
