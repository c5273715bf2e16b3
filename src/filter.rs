//! Translates a subsystem/devtype/tag filter into a classic-BPF program the kernel can run
//! against every datagram before it ever wakes user space.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use crate::{bloom64, hash32, Error, Result};

/// Maximum number of instructions a classic-BPF socket filter may contain.
pub const BPF_FILTER_LEN: usize = 512;

/// Subsystem filter: a unique mapping of subsystem name to an optional devtype constraint.
/// `BTreeMap` so filter compilation is deterministic across repeated calls (Testable Property
/// #9: two `filter_update`s with identical inputs install byte-identical programs).
pub type SubsystemFilter = BTreeMap<String, Option<String>>;

/// Tag filter: a unique set of tag strings, ordered for the same reason as [`SubsystemFilter`].
pub type TagFilter = BTreeSet<String>;

/// A classic-BPF program, backed by a fixed-capacity instruction array.
///
/// Instructions are appended with [`BpfProgram::stmt`] and [`BpfProgram::jmp`]; both fail once
/// the program would exceed [`BPF_FILTER_LEN`] instructions, which is how "compilation fails
/// deterministically" (Testable Property #3) is implemented rather than silently truncating.
#[derive(Clone)]
pub struct BpfProgram {
    instructions: [libc::sock_filter; BPF_FILTER_LEN],
    len: usize,
}

impl BpfProgram {
    fn new() -> Self {
        Self {
            instructions: [libc::sock_filter {
                code: 0,
                jt: 0,
                jf: 0,
                k: 0,
            }; BPF_FILTER_LEN],
            len: 0,
        }
    }

    fn push(&mut self, code: u16, jt: u8, jf: u8, k: u32) -> Result<usize> {
        if self.len >= BPF_FILTER_LEN {
            return Err(Error::InvalidArgument(format!(
                "filter program exceeds {BPF_FILTER_LEN} instructions"
            )));
        }
        let idx = self.len;
        self.instructions[idx] = libc::sock_filter { code, jt, jf, k };
        self.len += 1;
        Ok(idx)
    }

    /// Appends a non-branching statement (load, ALU, or unconditional return).
    fn stmt(&mut self, code: u16, k: u32) -> Result<usize> {
        self.push(code, 0, 0, k)
    }

    /// Appends a conditional branch, jumping `jt` instructions forward on match and `jf`
    /// instructions forward otherwise.
    fn jmp(&mut self, code: u16, k: u32, jt: u8, jf: u8) -> Result<usize> {
        self.push(code, jt, jf, k)
    }

    /// Number of instructions currently in the program.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gets the program as a `sock_fprog` FFI value for `SO_ATTACH_FILTER`.
    ///
    /// SAFETY: the returned `sock_fprog` borrows `self.instructions`; it must not outlive `self`
    /// and must only be passed to `setsockopt`, which copies the instructions into the kernel
    /// before returning.
    pub fn as_sock_fprog(&mut self) -> libc::sock_fprog {
        libc::sock_fprog {
            len: self.len as u16,
            filter: self.instructions.as_mut_ptr(),
        }
    }
}

impl PartialEq for BpfProgram {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len
            && self.instructions[..self.len]
                .iter()
                .zip(other.instructions[..other.len].iter())
                .all(|(a, b)| a.code == b.code && a.jt == b.jt && a.jf == b.jf && a.k == b.k)
    }
}

const BPF_LD_ABS: u16 = (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16;
const BPF_AND_K: u16 = (libc::BPF_ALU | libc::BPF_AND | libc::BPF_K) as u16;
const BPF_JEQ_K: u16 = (libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K) as u16;
const BPF_RET_K: u16 = (libc::BPF_RET | libc::BPF_K) as u16;

const RET_PASS: u32 = 0xffff_ffff;
const RET_DROP: u32 = 0;

/// Compiles a subsystem/tag filter into a classic-BPF program per the normative structure:
/// magic guard, then an optional tag-bloom block, then an optional subsystem/devtype block,
/// then an unconditional pass.
///
/// Returns `Err` if the compiled program would exceed [`BPF_FILTER_LEN`] instructions.
pub fn compile(subsystems: &SubsystemFilter, tags: &TagFilter) -> Result<BpfProgram> {
    let mut p = BpfProgram::new();

    // 1. magic guard: anything that isn't a peer-format message must still reach user space,
    // since kernel-format messages carry no magic at all.
    p.stmt(BPF_LD_ABS, crate::header::NetlinkHeader::MAGIC_OFFSET)?;
    p.jmp(BPF_JEQ_K, crate::header::MONITOR_MAGIC, 1, 0)?;
    p.stmt(BPF_RET_K, RET_PASS)?;

    // 2. tag-bloom block
    if !tags.is_empty() {
        let mut remaining = tags.len();

        for tag in tags {
            let bloom = bloom64(tag);
            let hi = (bloom >> 32) as u32;
            let lo = bloom as u32;

            remaining -= 1;
            // distance, in instructions, from this tag's final jmp to the instruction right
            // after the drop that closes the whole tag block (every later tag occupies exactly
            // 6 instructions, plus the one drop instruction at the very end).
            let skip_to_block_end = (remaining * 6 + 1) as u8;

            p.stmt(BPF_LD_ABS, crate::header::NetlinkHeader::FILTER_TAG_BLOOM_HI_OFFSET)?;
            p.stmt(BPF_AND_K, hi)?; // A &= hi
            p.jmp(BPF_JEQ_K, hi, 0, 3)?; // hi mismatch: skip to next tag's block

            p.stmt(BPF_LD_ABS, crate::header::NetlinkHeader::FILTER_TAG_BLOOM_LO_OFFSET)?;
            p.stmt(BPF_AND_K, lo)?; // A &= lo
            p.jmp(BPF_JEQ_K, lo, skip_to_block_end, 0)?; // lo match: tag matched, skip past block
        }

        // no tag matched
        p.stmt(BPF_RET_K, RET_DROP)?;
    }

    // 3. subsystem/devtype block
    if !subsystems.is_empty() {
        for (subsystem, devtype) in subsystems {
            let subsystem_hash = hash32(subsystem);

            p.stmt(BPF_LD_ABS, crate::header::NetlinkHeader::FILTER_SUBSYSTEM_HASH_OFFSET)?;

            match devtype {
                None => {
                    p.jmp(BPF_JEQ_K, subsystem_hash, 0, 1)?;
                    p.stmt(BPF_RET_K, RET_PASS)?;
                }
                Some(devtype) => {
                    p.jmp(BPF_JEQ_K, subsystem_hash, 0, 3)?;

                    p.stmt(BPF_LD_ABS, crate::header::NetlinkHeader::FILTER_DEVTYPE_HASH_OFFSET)?;
                    p.jmp(BPF_JEQ_K, hash32(devtype), 0, 1)?;
                    p.stmt(BPF_RET_K, RET_PASS)?;
                }
            }
        }

        // no subsystem entry matched
        p.stmt(BPF_RET_K, RET_DROP)?;
    }

    // 4. final fall-through
    p.stmt(BPF_RET_K, RET_PASS)?;

    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subsystems(pairs: &[(&str, Option<&str>)]) -> SubsystemFilter {
        pairs
            .iter()
            .map(|(s, d)| (s.to_string(), d.map(str::to_string)))
            .collect()
    }

    fn tags(names: &[&str]) -> TagFilter {
        names.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_compile_empty_filter_is_trivial_but_valid() {
        let p = compile(&SubsystemFilter::new(), &TagFilter::new()).unwrap();
        // magic guard (3) + final pass (1)
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn test_compile_subsystem_only_no_devtype() {
        let p = compile(&subsystems(&[("net", None)]), &TagFilter::new()).unwrap();
        // magic guard (3) + subsystem entry (1 load + 1 jmp + 1 ret) + drop (1) + final pass (1)
        assert_eq!(p.len(), 3 + 3 + 1 + 1);
    }

    #[test]
    fn test_compile_subsystem_with_devtype() {
        let p = compile(&subsystems(&[("usb", Some("usb_device"))]), &TagFilter::new()).unwrap();
        // magic guard (3) + (load + jmp + load + jmp + ret = 5) + drop (1) + final pass (1)
        assert_eq!(p.len(), 3 + 5 + 1 + 1);
    }

    #[test]
    fn test_compile_tags_only() {
        let p = compile(&SubsystemFilter::new(), &tags(&["systemd", "seat"])).unwrap();
        // magic guard (3) + 2 tags * 6 instructions + drop (1) + final pass (1)
        assert_eq!(p.len(), 3 + 2 * 6 + 1 + 1);
    }

    #[test]
    fn test_compile_is_idempotent() {
        let subs = subsystems(&[("usb", Some("usb_device")), ("net", None)]);
        let tgs = tags(&["systemd", "seat"]);

        let p1 = compile(&subs, &tgs).unwrap();
        let p2 = compile(&subs, &tgs).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_compile_fails_deterministically_over_budget() {
        let mut subs = SubsystemFilter::new();
        // each entry without a devtype costs 3 instructions; budget is 512, minus 3 (magic) minus
        // 1 (drop) minus 1 (final pass) leaves 507 for entries, i.e. 169 entries max.
        for i in 0..200 {
            subs.insert(format!("subsystem-{i}"), None);
        }

        let result = compile(&subs, &TagFilter::new());
        assert!(result.is_err());

        // fewer entries compiles fine
        let mut small = SubsystemFilter::new();
        for i in 0..10 {
            small.insert(format!("subsystem-{i}"), None);
        }
        assert!(compile(&small, &TagFilter::new()).is_ok());
    }

    #[test]
    fn test_tag_block_uses_tag_bloom_not_offset_as_and_mask() {
        // regression guard: the AND mask in the tag-bloom block must be the tag's own bloom
        // half, never a header field offset constant.
        let p = compile(&SubsystemFilter::new(), &tags(&["systemd"])).unwrap();
        let bloom = bloom64("systemd");
        let hi = (bloom >> 32) as u32;
        let lo = bloom as u32;

        // instruction 4 is "AND hi" (0: load magic, 1: jmp magic, 2: ret pass, 3: load hi, 4: and hi)
        assert_eq!(p.instructions[4].k, hi);
        assert_ne!(p.instructions[4].k, crate::header::NetlinkHeader::FILTER_TAG_BLOOM_HI_OFFSET);

        // instruction 7 is "AND lo" (5: jmp hi, 6: load lo, 7: and lo)
        assert_eq!(p.instructions[7].k, lo);
        assert_ne!(p.instructions[7].k, crate::header::NetlinkHeader::FILTER_TAG_BLOOM_LO_OFFSET);
    }
}
