//! ELF loading.
//!
//! Only the program-header table is consulted: every `LOAD` segment becomes
//! a binary VMA pointing at the segment bytes inside the kernel-resident
//! image, so pages are copied in on first touch and the bss tail past
//! `file_size` stays zero. Nothing is mapped eagerly.

use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use crate::err::{KResult, KernelError};
use crate::memory::addrspace::PagePerm;
use crate::memory::layout::{PAGE_SIZE, USTACK_PAGES, USTACK_TOP};
use crate::memory::phys::PhysState;
use crate::memory::vma::VmaKind;
use crate::process::{ProcId, ProcessTable};

/// Populate a fresh process from an ELF image: binary VMAs for the loadable
/// segments, an anonymous demand-paged stack, entry point and stack pointer
/// in the saved frame.
pub fn load(envs: &mut ProcessTable, proc: ProcId, binary: &'static [u8]) -> KResult<()> {
    let elf = ElfFile::new(binary).map_err(|_| KernelError::Invalid)?;
    let entry = elf.header.pt2.entry_point();

    let p = envs.get_mut(proc)?;
    for ph in elf.program_iter() {
        if ph.get_type() != Ok(Type::Load) {
            continue;
        }
        let flags = ph.flags();
        let mut perm = PagePerm::USER;
        if flags.is_write() {
            perm |= PagePerm::WRITE;
        }
        if !flags.is_execute() {
            perm |= PagePerm::NO_EXEC;
        }
        p.vmas.insert(
            VmaKind::Binary {
                src: binary.as_ptr() as u64 + ph.offset(),
                src_len: ph.file_size() as usize,
                dst: ph.virtual_addr(),
                dst_len: ph.mem_size() as usize,
            },
            ph.virtual_addr(),
            ph.mem_size() as usize,
            perm,
        )?;
    }

    // Demand-paged user stack just below the exception stack.
    let stack_len = USTACK_PAGES * PAGE_SIZE;
    let stack_base = USTACK_TOP - stack_len as u64;
    p.vmas.insert(
        VmaKind::Anon,
        stack_base,
        stack_len,
        PagePerm::USER | PagePerm::WRITE | PagePerm::NO_EXEC,
    )?;

    p.frame.rip = entry;
    p.frame.rsp = USTACK_TOP;
    p.frame.rbp = USTACK_TOP;
    Ok(())
}

/// Allocate a process and load `binary` into it (bring-up path).
pub fn spawn(
    envs: &mut ProcessTable,
    phys: &mut PhysState,
    binary: &'static [u8],
) -> KResult<ProcId> {
    let id = envs.alloc(phys, ProcId(0))?;
    load(envs, id, binary)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::phys::testing::phys_with_pages;
    use crate::swap::testing::swap_with_slots;
    use crate::traps::{handle_page_fault, FaultOutcome, PfError};

    const SEG_VA: u64 = 0x40_0000;

    /// Minimal static EXEC image: one RW LOAD segment, 16 payload bytes,
    /// a page of bss.
    fn tiny_elf() -> &'static [u8] {
        let mut v = alloc::vec![0u8; 0x78 + 16];
        // e_ident
        v[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        v[4] = 2; // 64-bit
        v[5] = 1; // little endian
        v[6] = 1; // version
        let put16 = |v: &mut [u8], at: usize, x: u16| v[at..at + 2].copy_from_slice(&x.to_le_bytes());
        let put32 = |v: &mut [u8], at: usize, x: u32| v[at..at + 4].copy_from_slice(&x.to_le_bytes());
        let put64 = |v: &mut [u8], at: usize, x: u64| v[at..at + 8].copy_from_slice(&x.to_le_bytes());
        put16(&mut v, 16, 2); // e_type EXEC
        put16(&mut v, 18, 0x3e); // x86-64
        put32(&mut v, 20, 1); // e_version
        put64(&mut v, 24, SEG_VA); // e_entry
        put64(&mut v, 32, 64); // e_phoff
        put16(&mut v, 52, 64); // e_ehsize
        put16(&mut v, 54, 56); // e_phentsize
        put16(&mut v, 56, 1); // e_phnum
        // program header at 64
        put32(&mut v, 64, 1); // PT_LOAD
        put32(&mut v, 68, 6); // RW
        put64(&mut v, 72, 0x78); // p_offset
        put64(&mut v, 80, SEG_VA); // p_vaddr
        put64(&mut v, 88, SEG_VA); // p_paddr
        put64(&mut v, 96, 16); // p_filesz
        put64(&mut v, 104, 0x1000); // p_memsz
        put64(&mut v, 112, 0x1000); // p_align
        for i in 0..16 {
            v[0x78 + i] = 0xA0 + i as u8;
        }
        alloc::boxed::Box::leak(v.into_boxed_slice())
    }

    #[test]
    fn spawn_builds_segments_stack_and_entry() {
        let mut envs = ProcessTable::new(1);
        let mut phys = phys_with_pages(256);
        let id = spawn(&mut envs, &mut phys, tiny_elf()).unwrap();

        let p = envs.get(id).unwrap();
        assert_eq!(p.frame.rip, SEG_VA);
        assert_eq!(p.frame.rsp, USTACK_TOP);
        // Segment area plus the stack area.
        assert_eq!(p.vmas.len(), 2);
        let seg = p.vmas.lookup(SEG_VA).unwrap();
        assert!(matches!(seg.kind, VmaKind::Binary { src_len: 16, .. }));
        assert!(seg.perm.contains(PagePerm::WRITE));
        assert!(p.vmas.lookup(USTACK_TOP - PAGE_SIZE as u64).is_some());
    }

    #[test]
    fn first_touch_copies_segment_and_zero_fills_bss() {
        let mut envs = ProcessTable::new(1);
        let mut phys = phys_with_pages(256);
        let mut swap = swap_with_slots(4);
        let id = spawn(&mut envs, &mut phys, tiny_elf()).unwrap();
        envs.cpus[0].cur = Some(id);

        assert_eq!(
            handle_page_fault(&mut envs, &mut phys, &mut swap, 0, id, SEG_VA, PfError::USER),
            FaultOutcome::Handled
        );
        let p = envs.get_mut(id).unwrap();
        let space = p.space.as_mut().unwrap();
        let (pfn, _, _) = space.lookup(&mut phys, SEG_VA).unwrap();
        let bytes = unsafe { phys.frame_bytes(pfn, PAGE_SIZE) };
        for i in 0..16 {
            assert_eq!(bytes[i], 0xA0 + i as u8);
        }
        assert!(bytes[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn garbage_image_is_rejected() {
        let mut envs = ProcessTable::new(1);
        let mut phys = phys_with_pages(256);
        let junk: &'static [u8] = alloc::boxed::Box::leak(alloc::vec![0u8; 32].into_boxed_slice());
        assert!(spawn(&mut envs, &mut phys, junk).is_err());
    }
}
