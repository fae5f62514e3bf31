//! 8-bit Timer/Counter0 simulation.
//!
//! The timer is evaluated lazily: nothing happens per system cycle until
//! either firmware touches a timer register or `next_update_cycle` is
//! reached. Catching up at that point consumes the elapsed system cycles
//! through the prescaler and advances TCNT0 in closed-form chunks between
//! "interesting" boundaries (compare values, TOP, BOTTOM), OR-ing compare
//! and overflow flags into TIFR0 as they are crossed.
//!
//! Supports Normal, CTC, fast PWM, and phase-correct PWM waveform modes,
//! including the OCR-as-TOP variants and their OCR shadow update points.

use super::{get_divider, increase_counter};

// Timer0 data-space register addresses.
const TIFR0: usize = 0x35;
const TCCR0A: usize = 0x44;
const TCCR0B: usize = 0x45;
const TCNT0: usize = 0x46;
const OCR0A: usize = 0x47;
const OCR0B: usize = 0x48;
/// PRR0; bit 5 powers down Timer0.
const PRR0: usize = 0x64;
const PRTIM0: u8 = 1 << 5;

/// Timer/Counter0 state.
///
/// Invariant: `tcnt <= top + 1` whenever the counter is running inside its
/// waveform window; `count_down` is only meaningful in phase-correct modes.
pub struct Timer8 {
    pub tcnt: u32,
    pub ocr_a: u32,
    pub ocr_b: u32,
    pub top: u32,
    pub tov: u32,
    pub divider: u32,
    pub divider_cycle: u32,
    pub count_down: bool,
    pub phase_correct: bool,
    pub update_ocr_at_top: bool,
    pub prev_update_cycle: u64,
    pub next_update_cycle: u64,
}

/// Derive TOP and the TOV boundary value from a 3-bit WGM field.
fn process_wgm8(wgm: u32, top: &mut u32, tov: &mut u32, ocr: u32) {
    *top = 0xFF;
    *tov = 0xFF;
    match wgm {
        0x0 => {} // normal
        0x1 => *tov = 0x00, // PWM, phase correct
        0x2 => *top = ocr,  // CTC
        0x3 => {}           // fast PWM
        0x5 => {
            // PWM, phase correct, TOP=OCRA
            *tov = 0x00;
            *top = ocr;
        }
        0x7 => *top = ocr, // fast PWM, TOP=OCRA
        _ => {}
    }
}

impl Timer8 {
    pub fn new() -> Self {
        Timer8 {
            tcnt: 0,
            ocr_a: 0,
            ocr_b: 0,
            top: 0xFF,
            tov: 0xFF,
            divider: 0,
            divider_cycle: 0,
            count_down: false,
            phase_correct: false,
            update_ocr_at_top: false,
            prev_update_cycle: 0,
            next_update_cycle: u64::MAX,
        }
    }

    pub fn reset(&mut self) {
        *self = Timer8::new();
    }

    /// Latch OCR shadow registers and re-derive TOP/TOV from them.
    fn refresh_ocr(&mut self, data: &[u8]) {
        self.ocr_a = data[OCR0A] as u32;
        self.ocr_b = data[OCR0B] as u32;
        let wgm = wgm_bits(data);
        process_wgm8(wgm, &mut self.top, &mut self.tov, self.ocr_a);
    }

    /// Consume `cycles` system cycles through the prescaler and advance TCNT0.
    fn catch_up(&mut self, data: &mut [u8], cycles: u64) {
        let mut timer_cycles = increase_counter(&mut self.divider_cycle, cycles, self.divider);

        let mut tcnt = self.tcnt;
        let mut count_down = self.count_down;
        let ocr_a = self.ocr_a;
        let ocr_b = self.ocr_b;
        let top = self.top;
        let mut tifr = data[TIFR0] & 0x7;

        while timer_cycles > 0 {
            if top == 0 && self.phase_correct {
                // counter pinned at BOTTOM
                tifr |= 0x1;
                tcnt = 0;
                break;
            }
            if count_down {
                let mut stop = 0;
                if ocr_a < tcnt {
                    stop = stop.max(ocr_a);
                }
                if ocr_b < tcnt {
                    stop = stop.max(ocr_b);
                }
                let t = (tcnt - stop).min(timer_cycles);
                timer_cycles -= t;
                tcnt -= t;
                if tcnt == 0 {
                    tifr |= 0x1;
                    count_down = false;
                }
            } else if tcnt > top {
                // Above TOP (e.g. TCNT written past a reduced TOP): run to wrap.
                let t = 16.min(timer_cycles);
                timer_cycles -= t;
                tcnt = (tcnt + t) & 0xFF;
                tifr |= 0x1;
            } else {
                if self.phase_correct && tcnt >= top {
                    // turnaround at TOP consumes no count
                    count_down = true;
                    continue;
                }
                let mut stop = if self.phase_correct { top } else { top + 1 };
                if ocr_a > tcnt {
                    stop = stop.min(ocr_a);
                }
                if ocr_b > tcnt {
                    stop = stop.min(ocr_b);
                }
                let t = (stop - tcnt).min(timer_cycles);
                timer_cycles -= t;
                tcnt += t;
                if tcnt == top + 1 {
                    tifr |= 0x1;
                    tcnt = 0;
                }
            }
            if tcnt == ocr_a {
                tifr |= 0x2;
            }
            if tcnt == ocr_b {
                tifr |= 0x4;
            }
        }

        self.tcnt = tcnt;
        self.count_down = count_down;
        data[TIFR0] |= tifr;
        data[TCNT0] = tcnt as u8;
    }

    /// Bring the timer forward to `cycle_count`, reconfigure from the control
    /// registers, and schedule the next interesting boundary.
    pub fn update(&mut self, data: &mut [u8], cycle_count: u64) {
        if self.divider != 0 && data[PRR0] & PRTIM0 == 0 {
            let cycles = cycle_count - self.prev_update_cycle;
            self.catch_up(data, cycles);
        }
        self.prev_update_cycle = cycle_count;

        let cs = (data[TCCR0B] & 0x7) as u32;
        self.divider = get_divider(cs);

        if self.divider == 0 || data[PRR0] & PRTIM0 != 0 {
            self.next_update_cycle = u64::MAX;
            return;
        }

        let wgm = wgm_bits(data);
        let wgm_mask = 1u32 << wgm;
        if wgm_mask & 0x5 != 0 {
            // normal / CTC: OCR is double-buffer free, latch immediately
            self.refresh_ocr(data);
        }
        self.update_ocr_at_top = wgm_mask & 0xAA != 0;
        if self.update_ocr_at_top && self.tcnt == self.top {
            self.refresh_ocr(data);
        }

        process_wgm8(wgm, &mut self.top, &mut self.tov, self.ocr_a);
        self.phase_correct = wgm_mask & 0x22 != 0;
        if !self.phase_correct {
            self.count_down = false;
        }

        self.next_update_cycle = cycle_count + self.cycles_to_next_boundary();
    }

    /// Force the counter value (TCNT0 write) after a catch-up.
    pub fn set_tcnt(&mut self, value: u8) {
        self.tcnt = value as u32;
    }

    /// System cycles until TCNT next reaches a compare value, TOV, or TOP.
    fn cycles_to_next_boundary(&self) -> u64 {
        let mut tcycles = u32::MAX;
        if self.count_down {
            tcycles = min_nonzero(tcycles, self.top, self.tcnt as i64);
            tcycles = min_nonzero(tcycles, self.top, self.tcnt as i64 - self.ocr_a as i64);
            tcycles = min_nonzero(tcycles, self.top, self.tcnt as i64 - self.ocr_b as i64);
        } else {
            if self.phase_correct {
                tcycles = min_nonzero(tcycles, self.top, self.top as i64 - self.tcnt as i64);
            } else {
                // distance to the wrap that raises TOV
                tcycles =
                    min_nonzero(tcycles, self.top + 1, self.top as i64 + 1 - self.tcnt as i64);
            }
            tcycles = min_nonzero(tcycles, self.top, self.ocr_a as i64 - self.tcnt as i64);
            tcycles = min_nonzero(tcycles, self.top, self.ocr_b as i64 - self.tcnt as i64);
        }
        if tcycles == u32::MAX {
            // every boundary coincides with the current value: one full period
            tcycles = self.top.max(1);
            if self.phase_correct {
                tcycles *= 2;
            }
        }
        (tcycles.max(1) as u64) * self.divider as u64 - self.divider_cycle as u64
    }
}

impl Default for Timer8 {
    fn default() -> Self {
        Self::new()
    }
}

#[inline(always)]
fn wgm_bits(data: &[u8]) -> u32 {
    ((data[TCCR0A] & 0x3) as u32) | (((data[TCCR0B] >> 1) & 0x4) as u32)
}

/// Fold a candidate boundary distance into `a`, ignoring non-positive
/// distances (already passed) and clamping to one full period.
#[inline(always)]
pub(super) fn min_nonzero(a: u32, top: u32, b: i64) -> u32 {
    if b <= 0 {
        return a.min(top.max(1));
    }
    a.min(b as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DATA_SIZE;

    fn setup(data: &mut [u8], cs: u8) -> Timer8 {
        data[TCCR0B] = cs;
        let mut t = Timer8::new();
        t.update(data, 0);
        t
    }

    #[test]
    fn test_normal_mode_overflow_sets_tov() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut t = setup(&mut data, 1);
        t.update(&mut data, 255);
        assert_eq!(t.tcnt, 255);
        assert_eq!(data[TIFR0] & 0x1, 0);
        t.update(&mut data, 256);
        assert_eq!(t.tcnt, 0);
        assert_eq!(data[TIFR0] & 0x1, 0x1);
    }

    #[test]
    fn test_prescaled_counting() {
        let mut data = vec![0u8; DATA_SIZE];
        let mut t = setup(&mut data, 3); // clk/64
        t.update(&mut data, 640);
        assert_eq!(t.tcnt, 10);
        assert_eq!(data[TCNT0], 10);
    }

    #[test]
    fn test_ctc_top_from_ocr() {
        let mut data = vec![0u8; DATA_SIZE];
        data[OCR0A] = 9;
        data[TCCR0A] = 0x2; // WGM=2 (CTC)
        let mut t = setup(&mut data, 1);
        assert_eq!(t.top, 9);
        // counter wraps at OCR0A+1 and flags both OCF0A and TOV
        t.update(&mut data, 10);
        assert_eq!(t.tcnt, 0);
        assert_eq!(data[TIFR0] & 0x2, 0x2);
    }

    #[test]
    fn test_compare_match_flag() {
        let mut data = vec![0u8; DATA_SIZE];
        data[OCR0B] = 5;
        let mut t = setup(&mut data, 1);
        t.update(&mut data, 5);
        assert_eq!(data[TIFR0] & 0x4, 0x4);
    }

    #[test]
    fn test_phase_correct_counts_down() {
        let mut data = vec![0u8; DATA_SIZE];
        data[TCCR0A] = 0x1; // WGM=1, phase correct, TOP=0xFF
        let mut t = setup(&mut data, 1);
        t.update(&mut data, 255);
        assert_eq!(t.tcnt, 255);
        assert!(!t.count_down);
        t.update(&mut data, 260);
        assert!(t.count_down);
        assert_eq!(t.tcnt, 250);
        // TOV fires at BOTTOM
        t.update(&mut data, 510);
        assert_eq!(t.tcnt, 0);
        assert_eq!(data[TIFR0] & 0x1, 0x1);
    }

    #[test]
    fn test_powered_down_never_schedules() {
        let mut data = vec![0u8; DATA_SIZE];
        data[PRR0] = PRTIM0;
        let mut t = setup(&mut data, 1);
        assert_eq!(t.next_update_cycle, u64::MAX);
        t.update(&mut data, 1000);
        assert_eq!(t.tcnt, 0);
    }

    #[test]
    fn test_lazy_equals_eager() {
        let mut data_a = vec![0u8; DATA_SIZE];
        let mut data_b = vec![0u8; DATA_SIZE];
        data_a[OCR0A] = 37;
        data_b[OCR0A] = 37;
        data_a[TCCR0A] = 0x2;
        data_b[TCCR0A] = 0x2;
        let mut lazy = setup(&mut data_a, 2);
        let mut eager = setup(&mut data_b, 2);
        for c in 1..=1000u64 {
            eager.update(&mut data_b, c);
        }
        lazy.update(&mut data_a, 1000);
        assert_eq!(lazy.tcnt, eager.tcnt);
        assert_eq!(data_a[TIFR0], data_b[TIFR0]);
    }
}
