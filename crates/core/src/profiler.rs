//! Execution profiler.
//!
//! Cycle counts accumulate per program word address while profiling is
//! enabled; the board attributes each system cycle to the instruction the
//! CPU is executing. On demand, [`Profiler::build_hotspots`] reconstructs
//! two aggregate views from the counts and the disassembly table:
//!
//! 1. **Symbol hotspots** — counts summed over each function symbol's range.
//! 2. **Synthetic hotspots** — contiguous instruction runs between recovered
//!    basic-block boundaries, trimmed of cold prefixes/suffixes and split on
//!    long unexecuted gaps.
//!
//! The block-boundary recovery is a heuristic: boundaries come from function
//! starts and from executed unconditional jumps/returns, skipping those that
//! merely hop over a skip-style predecessor. Callers get covering, count-
//! preserving hotspots, not exact basic blocks.

use crate::cpu::{Cpu, PC_MASK};
use crate::opcodes::{DisasmEntry, Op};
use crate::symbols::SymbolTable;
use crate::PROG_WORDS;

/// A contiguous range of disassembly-table entries with its cycle total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hotspot {
    /// First disassembly index.
    pub begin: usize,
    /// Last disassembly index (inclusive).
    pub end: usize,
    pub count: u64,
}

pub struct Profiler {
    pub enabled: bool,
    /// Cycles attributed per program word address.
    pub counts: Vec<u64>,
    /// Cycles spent with the CPU awake.
    pub total: u64,
    /// All cycles, including sleep.
    pub total_with_sleep: u64,
    prev_total: u64,
    prev_total_with_sleep: u64,
    /// CPU usage per frame (awake / total), most recent last.
    pub frame_cpu_usage: Vec<f32>,
    pub total_frames: u64,
    /// Cycle length of the last completed frame.
    pub prev_frame_cycles: u64,
    pub hotspots: Vec<Hotspot>,
    pub hotspots_symbol: Vec<Hotspot>,
}

impl Profiler {
    pub fn new() -> Self {
        Profiler {
            enabled: false,
            counts: vec![0; PROG_WORDS],
            total: 0,
            total_with_sleep: 0,
            prev_total: 0,
            prev_total_with_sleep: 0,
            frame_cpu_usage: Vec::new(),
            total_frames: 0,
            prev_frame_cycles: 0,
            hotspots: Vec::new(),
            hotspots_symbol: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.enabled = false;
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.total = 0;
        self.total_with_sleep = 0;
        self.prev_total = 0;
        self.prev_total_with_sleep = 0;
        self.frame_cpu_usage.clear();
        self.total_frames = 0;
        self.prev_frame_cycles = 0;
        self.hotspots.clear();
        self.hotspots_symbol.clear();
    }

    /// Attribute `cycles` to the instruction at `pc` (word address).
    #[inline]
    pub fn record_cycles(&mut self, pc: u16, cycles: u64, awake: bool) {
        self.total_with_sleep += cycles;
        if awake {
            self.total += cycles;
            if self.enabled {
                self.counts[(pc & PC_MASK) as usize] += cycles;
            }
        }
    }

    /// Close out a frame at a vsync: append its CPU usage and bound history.
    pub fn frame_boundary(&mut self) {
        let frame_total = self.total - self.prev_total;
        let frame_all = self.total_with_sleep - self.prev_total_with_sleep;
        self.prev_total = self.total;
        self.prev_total_with_sleep = self.total_with_sleep;
        let usage = if frame_all != 0 {
            frame_total as f64 / frame_all as f64
        } else {
            0.0
        };
        self.frame_cpu_usage.push(usage as f32);
        self.prev_frame_cycles = frame_all;
        self.total_frames += 1;

        if self.frame_cpu_usage.len() >= 65536 {
            self.frame_cpu_usage.drain(..32768);
        }
    }

    /// Rebuild both hotspot views from the current counts.
    pub fn build_hotspots(&mut self, cpu: &Cpu, symbols: Option<&SymbolTable>) {
        if !cpu.decoded || cpu.disassembled_prog.is_empty() {
            return;
        }
        let table = &cpu.disassembled_prog;
        let num_instrs = table.len();

        // symbol hotspots
        self.hotspots_symbol.clear();
        if let Some(syms) = symbols {
            for sym in syms.text.values() {
                if sym.size == 0 || sym.weak || sym.notype || sym.object {
                    continue;
                }
                let begin = cpu.addr_to_disassembled_index(sym.addr);
                let end = cpu.addr_to_disassembled_index(sym.addr + sym.size - 1);
                let mut count = 0;
                let first = (sym.addr / 2) as usize;
                let last = ((sym.addr as u32 + sym.size as u32) / 2) as usize;
                for w in first..last.min(self.counts.len()) {
                    count += self.counts[w];
                }
                if count == 0 {
                    continue;
                }
                self.hotspots_symbol.push(Hotspot { begin, end, count });
            }
        }
        self.hotspots_symbol.sort_by(|a, b| b.count.cmp(&a.count));

        // recover block boundaries
        let mut starts = vec![false; num_instrs];
        starts[num_instrs - 1] = true;
        if let Some(syms) = symbols {
            for sym in syms.text.values() {
                if sym.object {
                    continue;
                }
                let i = cpu.addr_to_disassembled_index(sym.addr);
                if i < num_instrs {
                    starts[i] = true;
                }
            }
        }

        for index in 0..num_instrs {
            let d = table[index];
            let word_addr = (d.addr / 2) as u16;
            // never-executed transfers don't split anything
            if self.counts[word_addr as usize] == 0 {
                continue;
            }
            let i = cpu.decoded_prog[word_addr as usize];

            // a skip-style or one-hop-branch predecessor means this transfer
            // is really conditional
            let mut conditional = false;
            if index > 0 {
                let dp = table[index - 1];
                let ip = cpu.decoded_prog[(dp.addr / 2) as usize];
                conditional = match ip.op {
                    Op::Sbrs | Op::Sbrc | Op::Sbis | Op::Sbic | Op::Cpse => true,
                    Op::Brbs | Op::Brbc => ip.word == 1 || ip.word == 2,
                    _ => false,
                };
            }

            let target = match i.op {
                Op::Jmp => Some(i.word & PC_MASK),
                Op::Rjmp => {
                    if (i.word as i16).unsigned_abs() <= 4 {
                        // tiny hops are treated as intra-block
                        continue;
                    }
                    Some((word_addr.wrapping_add(1).wrapping_add(i.word)) & PC_MASK)
                }
                Op::Ijmp | Op::Ret | Op::Reti => None,
                _ => continue, // calls and everything else fall through
            };

            if conditional {
                continue;
            }

            if index + 1 < num_instrs {
                starts[index + 1] = true;
            }
            if let Some(t) = target {
                let ti = cpu.addr_to_disassembled_index(t * 2);
                if ti < num_instrs {
                    starts[ti] = true;
                }
            }
        }

        // collect hotspots between boundaries
        self.hotspots.clear();
        let mut begin = 0usize;
        for index in 1..num_instrs {
            if !starts[index] {
                continue;
            }
            let h = Hotspot { begin, end: index - 1, count: 0 };
            begin = index;
            self.push_trimmed(h, table);
        }
        self.hotspots.sort_by(|a, b| b.count.cmp(&a.count));
    }

    /// Format the hottest synthetic hotspots with disassembly.
    pub fn report(&self, cpu: &Cpu, top: usize) -> String {
        let mut s = String::new();
        s.push_str(&format!(
            "cycles: {} awake / {} total, frames: {}\n",
            self.total, self.total_with_sleep, self.total_frames
        ));
        for h in self.hotspots.iter().take(top) {
            let first = cpu.disassembled_prog[h.begin].addr;
            let last = cpu.disassembled_prog[h.end].addr;
            let pct = if self.total > 0 {
                h.count as f64 / self.total as f64 * 100.0
            } else {
                0.0
            };
            s.push_str(&format!(
                "0x{:04X}-0x{:04X}  {:>10} cycles ({:>5.1}%)\n",
                first, last, h.count, pct
            ));
            for idx in h.begin..=h.end.min(h.begin + 8) {
                let addr = cpu.disassembled_prog[idx].addr;
                let i = cpu.decoded_prog[(addr / 2) as usize];
                s.push_str(&format!(
                    "  0x{:04X}: {:>10}  {}\n",
                    addr,
                    self.counts[(addr / 2) as usize],
                    crate::disasm::disassemble(i, addr / 2)
                ));
            }
        }
        s
    }

    /// Trim cold edges off a raw hotspot, split it on long unexecuted gaps,
    /// and push the surviving pieces.
    fn push_trimmed(&mut self, mut h: Hotspot, table: &[DisasmEntry]) {
        let count_at =
            |counts: &[u64], idx: usize| -> u64 { counts[(table[idx].addr / 2) as usize] };

        for j in h.begin..=h.end {
            h.count += count_at(&self.counts, j);
        }
        if h.count == 0 {
            return;
        }

        // trim low-count prefix and suffix
        while h.begin < h.end {
            let c = count_at(&self.counts, h.begin);
            if c > h.count / 256 {
                break;
            }
            h.count -= c;
            h.begin += 1;
        }
        while h.end > h.begin {
            let c = count_at(&self.counts, h.end);
            if c > h.count / 256 {
                break;
            }
            h.count -= c;
            h.end -= 1;
        }

        // split off a sub-hotspot whenever 4+ consecutive zero-count
        // instructions precede nonzero counts
        const GAP: usize = 4;
        let mut zero_run_start = h.begin;
        let mut run = 0usize;
        let mut i = h.begin;
        while i <= h.end {
            if count_at(&self.counts, i) == 0 {
                if run == 0 {
                    zero_run_start = i;
                }
                run += 1;
            } else {
                if run >= GAP && zero_run_start > h.begin {
                    let mut head = Hotspot { begin: h.begin, end: zero_run_start - 1, count: 0 };
                    for j in head.begin..=head.end {
                        head.count += count_at(&self.counts, j);
                    }
                    h.count -= head.count;
                    h.begin = i;
                    if head.count > 0 {
                        self.hotspots.push(head);
                    }
                }
                run = 0;
            }
            i += 1;
        }

        if h.count > 0 {
            self.hotspots.push(h);
        }
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::Symbol;

    fn prog_from_words(words: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for w in words {
            bytes.push(*w as u8);
            bytes.push((*w >> 8) as u8);
        }
        bytes
    }

    /// A program with two executed regions separated by an RJMP.
    fn profiled_cpu() -> (Cpu, Profiler) {
        // 0: NOP x8, 8: RJMP .+7 (to 16), 9..15: NOP (never run), 16..: NOP
        let mut words = vec![0u16; 32];
        words[8] = 0xC007;
        let mut cpu = Cpu::new();
        cpu.load_program(&prog_from_words(&words));
        let mut p = Profiler::new();
        p.enabled = true;
        for w in 0..=8u16 {
            p.record_cycles(w, 1, true);
        }
        for w in 16..24u16 {
            p.record_cycles(w, 2, true);
        }
        (cpu, p)
    }

    #[test]
    fn test_counts_accumulate_only_when_awake() {
        let mut p = Profiler::new();
        p.enabled = true;
        p.record_cycles(5, 3, true);
        p.record_cycles(5, 4, false);
        assert_eq!(p.counts[5], 3);
        assert_eq!(p.total, 3);
        assert_eq!(p.total_with_sleep, 7);
    }

    #[test]
    fn test_frame_boundary_usage() {
        let mut p = Profiler::new();
        p.record_cycles(0, 30, true);
        p.record_cycles(0, 10, false);
        p.frame_boundary();
        assert_eq!(p.frame_cpu_usage.len(), 1);
        assert!((p.frame_cpu_usage[0] - 0.75).abs() < 1e-6);
        assert_eq!(p.prev_frame_cycles, 40);
    }

    #[test]
    fn test_hotspots_cover_executed_instructions() {
        let (cpu, mut p) = profiled_cpu();
        p.build_hotspots(&cpu, None);
        let executed: Vec<usize> = (0..cpu.disassembled_prog.len())
            .filter(|&i| p.counts[(cpu.disassembled_prog[i].addr / 2) as usize] > 0)
            .collect();
        for idx in executed {
            assert!(
                p.hotspots.iter().any(|h| h.begin <= idx && idx <= h.end),
                "executed instruction {} not covered",
                idx
            );
        }
    }

    #[test]
    fn test_hotspot_counts_sum_to_total() {
        let (cpu, mut p) = profiled_cpu();
        p.build_hotspots(&cpu, None);
        let sum: u64 = p.hotspots.iter().map(|h| h.count).sum();
        let total: u64 = p.counts.iter().sum();
        assert_eq!(sum, total);
    }

    #[test]
    fn test_hotspots_sorted_descending() {
        let (cpu, mut p) = profiled_cpu();
        p.build_hotspots(&cpu, None);
        assert!(!p.hotspots.is_empty());
        for w in p.hotspots.windows(2) {
            assert!(w[0].count >= w[1].count);
        }
    }

    #[test]
    fn test_symbol_hotspots() {
        let (cpu, mut p) = profiled_cpu();
        let mut syms = SymbolTable::new();
        syms.insert(Symbol {
            addr: 0,
            size: 18, // words 0..9
            name: "main".into(),
            weak: false,
            notype: false,
            object: false,
        });
        syms.insert(Symbol {
            addr: 32,
            size: 16, // words 16..24
            name: "render".into(),
            weak: false,
            notype: false,
            object: false,
        });
        syms.insert(Symbol {
            addr: 60,
            size: 4,
            name: "cold".into(),
            weak: false,
            notype: false,
            object: false,
        });
        p.build_hotspots(&cpu, Some(&syms));
        // zero-count symbol dropped; hottest first
        assert_eq!(p.hotspots_symbol.len(), 2);
        assert_eq!(p.hotspots_symbol[0].count, 16); // render: 8 words x 2
        assert_eq!(p.hotspots_symbol[1].count, 9); // main: 9 words x 1
    }

    #[test]
    fn test_report_lists_hot_ranges() {
        let (cpu, mut p) = profiled_cpu();
        p.build_hotspots(&cpu, None);
        let report = p.report(&cpu, 4);
        assert!(report.contains("cycles"));
        assert!(report.contains("NOP"));
    }

    #[test]
    fn test_history_eviction() {
        let mut p = Profiler::new();
        for _ in 0..65536 {
            p.record_cycles(0, 1, true);
            p.frame_boundary();
        }
        assert_eq!(p.frame_cpu_usage.len(), 65536 - 32768);
        assert_eq!(p.total_frames, 65536);
    }
}
