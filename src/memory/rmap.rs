//! Reverse mapping index: physical frame → set of (process, virtual
//! address, permission) triples.
//!
//! Each frame (or swap slot, after eviction) holds the head of a two-level
//! list: one node per referencing process, each carrying a list of
//! `(va, perm)` entries. Nodes come from fixed pools seeded at boot and
//! grown one page's worth at a time up to a cap; removal recycles nodes onto
//! a free chain. The pools belong to the page-allocator lock domain.

use alloc::vec::Vec;
use core::mem;

use crate::err::{KResult, KernelError};
use crate::memory::addrspace::PagePerm;
use crate::memory::layout::{PAGE_SIZE, RMAP_POOL_MAX_PAGES};
use crate::process::ProcId;

#[derive(Debug, Clone)]
pub struct ProcNode {
    pub proc: ProcId,
    /// Head of this process's `(va, perm)` list.
    pub list: Option<u32>,
    /// Next process node, or next free node while recycled.
    pub next: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct VaNode {
    pub va: u64,
    pub perm: PagePerm,
    pub next: Option<u32>,
}

trait PoolNode: Clone {
    fn blank() -> Self;
    fn next_link(&mut self) -> &mut Option<u32>;
}

impl PoolNode for ProcNode {
    fn blank() -> Self {
        ProcNode {
            proc: ProcId(0),
            list: None,
            next: None,
        }
    }
    fn next_link(&mut self) -> &mut Option<u32> {
        &mut self.next
    }
}

impl PoolNode for VaNode {
    fn blank() -> Self {
        VaNode {
            va: 0,
            perm: PagePerm::empty(),
            next: None,
        }
    }
    fn next_link(&mut self) -> &mut Option<u32> {
        &mut self.next
    }
}

struct Pool<T: PoolNode> {
    nodes: Vec<T>,
    free: Option<u32>,
}

impl<T: PoolNode> Pool<T> {
    fn per_page() -> usize {
        (PAGE_SIZE / mem::size_of::<T>()).max(1)
    }

    fn seeded() -> Self {
        let mut pool = Pool {
            nodes: Vec::new(),
            free: None,
        };
        pool.grow().expect("seed pool");
        pool
    }

    /// Add one page's worth of nodes, up to the pool cap.
    fn grow(&mut self) -> KResult<()> {
        let per_page = Self::per_page();
        if self.nodes.len() + per_page > RMAP_POOL_MAX_PAGES * per_page {
            return Err(KernelError::NoMem);
        }
        let start = self.nodes.len() as u32;
        self.nodes.resize(self.nodes.len() + per_page, T::blank());
        for i in 0..per_page as u32 {
            let idx = start + i;
            *self.nodes[idx as usize].next_link() = self.free;
            self.free = Some(idx);
        }
        Ok(())
    }

    fn alloc(&mut self, node: T) -> KResult<u32> {
        if self.free.is_none() {
            self.grow()?;
        }
        let idx = self.free.expect("free chain after grow");
        self.free = *self.nodes[idx as usize].next_link();
        self.nodes[idx as usize] = node;
        Ok(idx)
    }

    fn recycle(&mut self, idx: u32) {
        self.nodes[idx as usize] = T::blank();
        *self.nodes[idx as usize].next_link() = self.free;
        self.free = Some(idx);
    }
}

pub struct RmapPools {
    procs: Pool<ProcNode>,
    vas: Pool<VaNode>,
}

impl RmapPools {
    pub fn new() -> Self {
        RmapPools {
            procs: Pool::seeded(),
            vas: Pool::seeded(),
        }
    }

    fn find_proc(&self, head: Option<u32>, proc: ProcId) -> Option<u32> {
        let mut cur = head;
        while let Some(idx) = cur {
            let node = &self.procs.nodes[idx as usize];
            if node.proc == proc {
                return Some(idx);
            }
            cur = node.next;
        }
        None
    }

    /// Record that `proc` maps the owning frame at `va` with `perm`.
    pub fn add(
        &mut self,
        head: &mut Option<u32>,
        proc: ProcId,
        va: u64,
        perm: PagePerm,
    ) -> KResult<()> {
        let pidx = match self.find_proc(*head, proc) {
            Some(idx) => idx,
            None => {
                let idx = self.procs.alloc(ProcNode {
                    proc,
                    list: None,
                    next: *head,
                })?;
                *head = Some(idx);
                idx
            }
        };
        let old_list = self.procs.nodes[pidx as usize].list;
        let vidx = self.vas.alloc(VaNode {
            va,
            perm,
            next: old_list,
        })?;
        self.procs.nodes[pidx as usize].list = Some(vidx);
        Ok(())
    }

    /// Drop the `(proc, va)` entry if present; prunes the process node when
    /// its list empties.
    pub fn remove(&mut self, head: &mut Option<u32>, proc: ProcId, va: u64) {
        let Some(pidx) = self.find_proc(*head, proc) else {
            return;
        };
        let mut cur = self.procs.nodes[pidx as usize].list;
        let mut prev: Option<u32> = None;
        while let Some(vidx) = cur {
            let next = self.vas.nodes[vidx as usize].next;
            if self.vas.nodes[vidx as usize].va == va {
                match prev {
                    Some(p) => self.vas.nodes[p as usize].next = next,
                    None => self.procs.nodes[pidx as usize].list = next,
                }
                self.vas.recycle(vidx);
                break;
            }
            prev = cur;
            cur = next;
        }
        if self.procs.nodes[pidx as usize].list.is_none() {
            self.unlink_proc(head, pidx);
        }
    }

    /// Remove every entry `proc` holds on this list (process teardown).
    pub fn remove_proc(&mut self, head: &mut Option<u32>, proc: ProcId) {
        let Some(pidx) = self.find_proc(*head, proc) else {
            return;
        };
        let mut cur = self.procs.nodes[pidx as usize].list;
        while let Some(vidx) = cur {
            cur = self.vas.nodes[vidx as usize].next;
            self.vas.recycle(vidx);
        }
        self.procs.nodes[pidx as usize].list = None;
        self.unlink_proc(head, pidx);
    }

    fn unlink_proc(&mut self, head: &mut Option<u32>, pidx: u32) {
        let mut cur = *head;
        let mut prev: Option<u32> = None;
        while let Some(idx) = cur {
            let next = self.procs.nodes[idx as usize].next;
            if idx == pidx {
                match prev {
                    Some(p) => self.procs.nodes[p as usize].next = next,
                    None => *head = next,
                }
                self.procs.recycle(pidx);
                return;
            }
            prev = cur;
            cur = next;
        }
    }

    /// Rewrite the recorded permission of `(proc, va)` (COW upgrade).
    pub fn update_perm(&mut self, head: Option<u32>, proc: ProcId, va: u64, perm: PagePerm) {
        if let Some(pidx) = self.find_proc(head, proc) {
            let mut cur = self.procs.nodes[pidx as usize].list;
            while let Some(vidx) = cur {
                let node = &mut self.vas.nodes[vidx as usize];
                if node.va == va {
                    node.perm = perm;
                    return;
                }
                cur = node.next;
            }
        }
    }

    /// Flatten the list; the swap engine iterates the result while mutating
    /// page tables and the pools themselves.
    pub fn collect(&self, head: Option<u32>) -> Vec<(ProcId, u64, PagePerm)> {
        let mut out = Vec::new();
        let mut cur = head;
        while let Some(pidx) = cur {
            let pnode = &self.procs.nodes[pidx as usize];
            let mut vcur = pnode.list;
            while let Some(vidx) = vcur {
                let vnode = &self.vas.nodes[vidx as usize];
                out.push((pnode.proc, vnode.va, vnode.perm));
                vcur = vnode.next;
            }
            cur = pnode.next;
        }
        out
    }

    pub fn count(&self, head: Option<u32>) -> usize {
        self.collect(head).len()
    }

    pub fn contains_proc(&self, head: Option<u32>, proc: ProcId) -> bool {
        self.find_proc(head, proc).is_some()
    }

    /// Recycle an entire detached chain (swap-in rebuilds its entries
    /// through `add`, so the old nodes just go back to the free lists).
    pub fn release_chain(&mut self, head: &mut Option<u32>) {
        while let Some(pidx) = *head {
            let proc = self.procs.nodes[pidx as usize].proc;
            self.remove_proc(head, proc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm() -> PagePerm {
        PagePerm::USER | PagePerm::WRITE
    }

    #[test]
    fn add_collect_remove() {
        let mut pools = RmapPools::new();
        let mut head = None;
        pools.add(&mut head, ProcId(1), 0x1000, perm()).unwrap();
        pools.add(&mut head, ProcId(1), 0x2000, perm()).unwrap();
        pools.add(&mut head, ProcId(2), 0x1000, perm()).unwrap();
        assert_eq!(pools.count(head), 3);
        assert!(pools.contains_proc(head, ProcId(1)));

        pools.remove(&mut head, ProcId(1), 0x1000);
        assert_eq!(pools.count(head), 2);
        pools.remove(&mut head, ProcId(1), 0x2000);
        assert!(!pools.contains_proc(head, ProcId(1)));
        assert!(pools.contains_proc(head, ProcId(2)));

        pools.remove_proc(&mut head, ProcId(2));
        assert_eq!(head, None);
    }

    #[test]
    fn nodes_are_recycled() {
        let mut pools = RmapPools::new();
        let mut head = None;
        for round in 0..4 {
            for i in 0..64u64 {
                pools
                    .add(&mut head, ProcId(round), i * 0x1000, perm())
                    .unwrap();
            }
            pools.remove_proc(&mut head, ProcId(round));
            assert_eq!(head, None);
        }
        // Rounds far exceed one seed page; recycling keeps the pool small.
        assert!(pools.vas.nodes.len() <= 2 * Pool::<VaNode>::per_page());
    }

    #[test]
    fn update_perm_rewrites_entry() {
        let mut pools = RmapPools::new();
        let mut head = None;
        pools.add(&mut head, ProcId(7), 0x5000, perm()).unwrap();
        pools.update_perm(head, ProcId(7), 0x5000, PagePerm::USER);
        let all = pools.collect(head);
        assert_eq!(all, alloc::vec![(ProcId(7), 0x5000, PagePerm::USER)]);
    }
}
