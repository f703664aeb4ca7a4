//! kernel-vm crate 功能性验证测试
//!
//! 用 `std::alloc` 实现 PageManager（物理页号=宿主机地址>>12，恒等转换），
//! 在用户态完整验证三级页表的映射、双页表一致性与回滚路径。

use kernel_vm::page_table::{PPN, Sv39, VmFlags};
use kernel_vm::{
    copy_in, copy_in_str, copy_out, free_walk, kvm_clone, kvm_free, uvm_alloc, uvm_copy,
    uvm_create, uvm_dealloc, uvm_free, uvm_init, PageManager, MAXUVA, PAGE_SIZE, VKSTACK,
};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashSet;
use std::ptr::NonNull;

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// 宿主机页管理器：记录在用页并支持配额，用于断言无泄漏与回滚。
struct HostManager {
    live: HashSet<usize>,
    budget: Option<usize>,
}

impl HostManager {
    fn new() -> Self {
        Self {
            live: HashSet::new(),
            budget: None,
        }
    }

    fn with_budget(budget: usize) -> Self {
        Self {
            live: HashSet::new(),
            budget: Some(budget),
        }
    }

    fn live_pages(&self) -> usize {
        self.live.len()
    }
}

impl PageManager<Sv39> for HostManager {
    fn allocate(&mut self) -> Option<PPN<Sv39>> {
        if let Some(b) = self.budget.as_mut() {
            if *b == 0 {
                return None;
            }
            *b -= 1;
        }
        let ptr = unsafe { alloc_zeroed(page_layout()) };
        assert!(!ptr.is_null());
        let pa = ptr as usize;
        self.live.insert(pa);
        Some(PPN::new(pa >> 12))
    }

    fn deallocate(&mut self, ppn: PPN<Sv39>) {
        let pa = ppn.val() << 12;
        assert!(self.live.remove(&pa), "double free of {pa:#x}");
        unsafe { dealloc(pa as *mut u8, page_layout()) };
    }

    fn p_to_v<T>(&self, ppn: PPN<Sv39>) -> NonNull<T> {
        NonNull::new((ppn.val() << 12) as *mut T).unwrap()
    }

    fn v_to_p<T>(&self, ptr: NonNull<T>) -> PPN<Sv39> {
        PPN::new(ptr.as_ptr() as usize >> 12)
    }
}

fn vrwxu() -> VmFlags<Sv39> {
    VmFlags::build_from_str("VRWXU")
}

fn u_flag() -> VmFlags<Sv39> {
    VmFlags::build_from_str("U")
}

#[test]
fn test_map_translate_unmap() {
    let mut m = HostManager::new();
    let pt = uvm_create(&mut m).unwrap();
    let page = m.allocate().unwrap();
    let pa = page.val() << 12;

    pt.map_pages(&mut m, 0x1000, PAGE_SIZE, pa, vrwxu()).unwrap();
    let (got_pa, fl) = pt.translate(&mut m, 0x1234).unwrap();
    assert_eq!(got_pa, pa);
    assert!(fl.contains(u_flag()));
    assert_eq!(pt.walk_addr(&mut m, 0x1000).unwrap(), pa);

    // 未映射的地址
    assert!(pt.translate(&mut m, 0x3000).is_none());
    assert!(pt.walk_addr(&mut m, 0x3000).is_none());

    pt.unmap_pages(&mut m, 0x1000, 1, true);
    assert!(pt.translate(&mut m, 0x1000).is_none());

    free_walk(&mut m, pt);
    assert_eq!(m.live_pages(), 0);
}

#[test]
fn test_walk_addr_requires_user_bit() {
    let mut m = HostManager::new();
    let pt = uvm_create(&mut m).unwrap();
    let page = m.allocate().unwrap();
    let pa = page.val() << 12;
    pt.map_pages(&mut m, 0x2000, PAGE_SIZE, pa, VmFlags::build_from_str("VRW"))
        .unwrap();
    // V 无 U：translate 可见，walk_addr 拒绝
    assert!(pt.translate(&mut m, 0x2000).is_some());
    assert!(pt.walk_addr(&mut m, 0x2000).is_none());
    pt.unmap_pages(&mut m, 0x2000, 1, true);
    free_walk(&mut m, pt);
}

#[test]
#[should_panic(expected = "remap")]
fn test_remap_panics() {
    let mut m = HostManager::new();
    let pt = uvm_create(&mut m).unwrap();
    let page = m.allocate().unwrap();
    let pa = page.val() << 12;
    pt.map_pages(&mut m, 0, PAGE_SIZE, pa, vrwxu()).unwrap();
    pt.map_pages(&mut m, 0, PAGE_SIZE, pa, vrwxu()).unwrap();
}

#[test]
#[should_panic(expected = "unmap_pages")]
fn test_unmap_missing_panics() {
    let mut m = HostManager::new();
    let pt = uvm_create(&mut m).unwrap();
    pt.unmap_pages(&mut m, 0x5000, 1, false);
}

#[test]
fn test_uvm_init_maps_both_tables() {
    let mut m = HostManager::new();
    let upt = uvm_create(&mut m).unwrap();
    let kpt = uvm_create(&mut m).unwrap();
    let blob = [0x13u8, 0x05, 0x45, 0x02, 0x73];
    uvm_init(&mut m, upt, kpt, &blob);

    let (upa, ufl) = upt.translate(&mut m, 0).unwrap();
    let (kpa, kfl) = kpt.translate(&mut m, 0).unwrap();
    assert_eq!(upa, kpa);
    assert!(ufl.contains(u_flag()));
    assert!(!kfl.contains(u_flag()));

    // 页内容即装入的程序
    let data = unsafe { std::slice::from_raw_parts(upa as *const u8, blob.len()) };
    assert_eq!(data, &blob);

    uvm_free(&mut m, upt, PAGE_SIZE);
    kpt.unmap_pages(&mut m, 0, 1, false);
    free_walk(&mut m, kpt);
    assert_eq!(m.live_pages(), 0);
}

#[test]
fn test_uvm_alloc_dealloc_pair_invariant() {
    let mut m = HostManager::new();
    let upt = uvm_create(&mut m).unwrap();
    let kpt = uvm_create(&mut m).unwrap();

    let sz = uvm_alloc(&mut m, upt, kpt, 0, 3 * PAGE_SIZE).unwrap();
    assert_eq!(sz, 3 * PAGE_SIZE);
    for va in (0..sz).step_by(PAGE_SIZE) {
        let (upa, ufl) = upt.translate(&mut m, va).unwrap();
        let (kpa, kfl) = kpt.translate(&mut m, va).unwrap();
        assert_eq!(upa, kpa, "upt/kpt disagree at {va:#x}");
        assert!(ufl.contains(u_flag()));
        assert!(!kfl.contains(u_flag()));
    }

    // 收缩一页
    let sz = uvm_dealloc(&mut m, upt, kpt, sz, 2 * PAGE_SIZE);
    assert_eq!(sz, 2 * PAGE_SIZE);
    assert!(upt.translate(&mut m, 2 * PAGE_SIZE).is_none());
    assert!(kpt.translate(&mut m, 2 * PAGE_SIZE).is_none());

    uvm_free(&mut m, upt, sz);
    kpt.unmap_pages(&mut m, 0, 2, false);
    free_walk(&mut m, kpt);
    assert_eq!(m.live_pages(), 0);
}

#[test]
fn test_uvm_alloc_exhaustion_rolls_back() {
    // 配额只够前几页，失败后用量应回到基线
    let mut m = HostManager::with_budget(64);
    let upt = uvm_create(&mut m).unwrap();
    let kpt = uvm_create(&mut m).unwrap();
    let base = uvm_alloc(&mut m, upt, kpt, 0, 2 * PAGE_SIZE).unwrap();
    let live_before = m.live_pages();

    m.budget = Some(1);
    assert!(uvm_alloc(&mut m, upt, kpt, base, 16 * PAGE_SIZE).is_none());
    assert_eq!(m.live_pages(), live_before);
    // 原有映射不受影响
    assert!(upt.translate(&mut m, PAGE_SIZE).is_some());

    m.budget = None;
    uvm_free(&mut m, upt, base);
    kpt.unmap_pages(&mut m, 0, base / PAGE_SIZE, false);
    free_walk(&mut m, kpt);
    assert_eq!(m.live_pages(), 0);
}

#[test]
fn test_uvm_alloc_beyond_maxuva_fails() {
    let mut m = HostManager::new();
    let upt = uvm_create(&mut m).unwrap();
    let kpt = uvm_create(&mut m).unwrap();
    assert!(uvm_alloc(&mut m, upt, kpt, 0, MAXUVA + PAGE_SIZE).is_none());
    free_walk(&mut m, upt);
    free_walk(&mut m, kpt);
}

#[test]
fn test_uvm_copy_deep_copies() {
    let mut m = HostManager::new();
    let upt = uvm_create(&mut m).unwrap();
    let kpt = uvm_create(&mut m).unwrap();
    let sz = uvm_alloc(&mut m, upt, kpt, 0, 2 * PAGE_SIZE).unwrap();

    // 写入父进程页
    let (pa, _) = upt.translate(&mut m, 0).unwrap();
    unsafe { std::ptr::write_bytes(pa as *mut u8, 0xAB, PAGE_SIZE) };

    let new_upt = uvm_create(&mut m).unwrap();
    let new_kpt = uvm_create(&mut m).unwrap();
    uvm_copy(&mut m, upt, new_upt, new_kpt, sz).unwrap();

    let (child_pa, child_fl) = new_upt.translate(&mut m, 0).unwrap();
    assert_ne!(child_pa, pa, "child must get fresh pages");
    let child = unsafe { std::slice::from_raw_parts(child_pa as *const u8, PAGE_SIZE) };
    assert!(child.iter().all(|&b| b == 0xAB));
    assert!(child_fl.contains(u_flag()));
    let (child_kpa, child_kfl) = new_kpt.translate(&mut m, 0).unwrap();
    assert_eq!(child_kpa, child_pa);
    assert!(!child_kfl.contains(u_flag()));

    uvm_free(&mut m, upt, sz);
    kpt.unmap_pages(&mut m, 0, sz / PAGE_SIZE, false);
    free_walk(&mut m, kpt);
    uvm_free(&mut m, new_upt, sz);
    new_kpt.unmap_pages(&mut m, 0, sz / PAGE_SIZE, false);
    free_walk(&mut m, new_kpt);
    assert_eq!(m.live_pages(), 0);
}

#[test]
fn test_kvm_clone_shares_and_kvm_free_spares_shared() {
    let mut m = HostManager::new();

    // "内核页表"：在共享区间（顶级项 4）映射一页
    let kernel = uvm_create(&mut m).unwrap();
    let page = m.allocate().unwrap();
    let shared_va = 0x1_0000_0000usize;
    kernel
        .map_pages(&mut m, shared_va, PAGE_SIZE, page.val() << 12, VmFlags::build_from_str("VRW"))
        .unwrap();

    let kpt = kvm_clone(&mut m, kernel).unwrap();
    // 共享项透过克隆可见
    let (pa, _) = kpt.translate(&mut m, shared_va).unwrap();
    assert_eq!(pa, page.val() << 12);

    // 映射私有内核栈
    let stack = m.allocate().unwrap();
    kpt.map_pages(&mut m, VKSTACK, PAGE_SIZE, stack.val() << 12, VmFlags::build_from_str("VRW"))
        .unwrap();

    let live_before = m.live_pages();
    kvm_free(&mut m, kpt, true);
    // 回收：kpt 根页、VKSTACK 子树两级、栈页；共享子树原样保留
    assert!(m.live_pages() < live_before);
    assert!(m.live.contains(&(page.val() << 12)));
    let (pa, _) = kernel.translate(&mut m, shared_va).unwrap();
    assert_eq!(pa, page.val() << 12);

    kernel.unmap_pages(&mut m, shared_va, 1, true);
    free_walk(&mut m, kernel);
    assert_eq!(m.live_pages(), 0);
}

#[test]
fn test_copy_in_out_cross_page() {
    let mut m = HostManager::new();
    let upt = uvm_create(&mut m).unwrap();
    let kpt = uvm_create(&mut m).unwrap();
    let sz = uvm_alloc(&mut m, upt, kpt, 0, 2 * PAGE_SIZE).unwrap();

    // 跨页写入再读出
    let msg = b"hello across the page boundary";
    let dstva = PAGE_SIZE - 7;
    copy_out(&mut m, upt, dstva, msg).unwrap();
    let mut back = [0u8; 30];
    copy_in(&mut m, upt, &mut back, dstva).unwrap();
    assert_eq!(&back, msg);

    // NUL 结尾字符串
    copy_out(&mut m, upt, 0x10, b"init\0").unwrap();
    let mut name = [0u8; 16];
    let len = copy_in_str(&mut m, upt, &mut name, 0x10).unwrap();
    assert_eq!(len, 4);
    assert_eq!(&name[..4], b"init");

    // 未映射区域失败
    assert!(copy_out(&mut m, upt, MAXUVA - PAGE_SIZE, b"x").is_err());

    uvm_free(&mut m, upt, sz);
    kpt.unmap_pages(&mut m, 0, sz / PAGE_SIZE, false);
    free_walk(&mut m, kpt);
    assert_eq!(m.live_pages(), 0);
}

#[test]
fn test_copy2_bounds_check() {
    // 越界在解引用之前被拒绝，可以安全调用
    let mut buf = [0u8; 8];
    assert!(unsafe { kernel_vm::copy_in2(0, &mut buf, 0x4000) }.is_err());
    assert!(unsafe { kernel_vm::copy_out2(16, 12, b"abcdefgh") }.is_err());
    assert!(unsafe { kernel_vm::copy_in_str2(0, &mut buf, 0x4000) }.is_err());
}
