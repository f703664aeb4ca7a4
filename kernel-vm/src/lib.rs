//! kernel-vm: Sv39 三级页表与双页表地址空间操作
//!
//! 每个进程有一张用户页表 upt 和一张进程内核页表 kpt：
//! 同一用户虚地址在两张表里指向同一物理页，upt 带 U 位而 kpt 不带。
//! 调度器装载 kpt 之后，内核用普通访存即可读写用户内存，
//! 系统调用参数拷贝退化为 memcpy（见 [`copy_in2`] 等）。
//!
//! 物理页的取得与释放通过 [`PageManager`] 注入：内核用页帧分配器实现，
//! 宿主机测试用 `std::alloc` 实现。

#![no_std]

pub extern crate page_table;

use core::ptr::NonNull;
use page_table::{Pte, VmFlags, VmMeta, PPN};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_BITS: usize = 12;
const NENTRY: usize = 512;

/// Sv39 虚地址上限。
pub const MAXVA: usize = 1 << 38;
/// 每个 upt 顶端的跳板页，R|X。
pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;
/// 跳板页之下的 trapframe 页，R|W，每进程私有。
pub const TRAPFRAME: usize = TRAMPOLINE - PAGE_SIZE;
/// 用户地址空间上限。占据顶级页表第 0 项，整项在 kpt 中私有。
pub const MAXUVA: usize = 0x4000_0000;
/// 进程内核栈的固定虚地址。占据顶级页表第 1 项，与内核共享项不相交。
pub const VKSTACK: usize = 0x8000_0000 - PAGE_SIZE;

/// 物理页管理抽象。`allocate` 返回清零页。
pub trait PageManager<Meta: VmMeta> {
    fn allocate(&mut self) -> Option<PPN<Meta>>;
    fn deallocate(&mut self, ppn: PPN<Meta>);
    /// 物理页号转当前地址空间中可访问的指针。
    fn p_to_v<T>(&self, ppn: PPN<Meta>) -> NonNull<T>;
    fn v_to_p<T>(&self, ptr: NonNull<T>) -> PPN<Meta>;
}

#[inline]
fn px(level: usize, va: usize) -> usize {
    (va >> (PAGE_BITS + 9 * level)) & (NENTRY - 1)
}

#[inline]
pub fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn flags<Meta: VmMeta>(s: &str) -> VmFlags<Meta> {
    // `page_table::VmFlags::build_from_str` is only implemented for the
    // concrete RISC-V `Sv<N>` type, not generically over `VmMeta`, so the
    // same bit mapping is reproduced here to keep this helper generic.
    let mut raw = 0usize;
    for c in s.chars() {
        raw |= match c {
            'V' | 'v' => 1 << 0,
            'R' | 'r' => 1 << 1,
            'W' | 'w' => 1 << 2,
            'X' | 'x' => 1 << 3,
            'U' | 'u' => 1 << 4,
            'G' | 'g' => 1 << 5,
            'A' | 'a' => 1 << 6,
            'D' | 'd' => 1 << 7,
            _ => 0,
        };
    }
    unsafe { VmFlags::from_raw(raw) }
}

fn empty_pte<Meta: VmMeta>() -> Pte<Meta> {
    unsafe { VmFlags::<Meta>::from_raw(0) }.build_pte(PPN::new(0))
}

/// 页表项是否为叶（携带 R/W/X 任一权限）。
fn is_leaf<Meta: VmMeta>(pte: Pte<Meta>) -> bool {
    let fl = pte.flags();
    fl.contains(flags("R")) || fl.contains(flags("W")) || fl.contains(flags("X"))
}

/// 一张三级页表，以根页的物理页号标识。
pub struct PageTable<Meta: VmMeta> {
    root: PPN<Meta>,
}

impl<Meta: VmMeta> Clone for PageTable<Meta> {
    fn clone(&self) -> Self {
        Self { root: self.root }
    }
}

impl<Meta: VmMeta> Copy for PageTable<Meta> {}

impl<Meta: VmMeta> PageTable<Meta> {
    pub fn new(root: PPN<Meta>) -> Self {
        Self { root }
    }

    pub fn root_ppn(&self) -> PPN<Meta> {
        self.root
    }

    /// 解析 va 对应的叶项指针，2→1→0 逐级下降。
    /// `alloc` 时缺失的中间页表会被补齐并标记 V；叶项本身不会被创建。
    fn walk<M: PageManager<Meta>>(
        &self,
        mgr: &mut M,
        va: usize,
        alloc: bool,
    ) -> Option<*mut Pte<Meta>> {
        assert!(va < MAXVA, "walk");
        let mut table: *mut Pte<Meta> = mgr.p_to_v(self.root).as_ptr();
        for level in [2, 1] {
            let pte_ptr = unsafe { table.add(px(level, va)) };
            let pte = unsafe { pte_ptr.read() };
            if pte.is_valid() {
                table = mgr.p_to_v(pte.ppn()).as_ptr();
            } else {
                if !alloc {
                    return None;
                }
                let child = mgr.allocate()?;
                unsafe { pte_ptr.write(flags::<Meta>("V").build_pte(child)) };
                table = mgr.p_to_v(child).as_ptr();
            }
        }
        Some(unsafe { table.add(px(0, va)) })
    }

    /// va 所在页的物理地址与叶项权限；未映射返回 None。
    pub fn translate<M: PageManager<Meta>>(
        &self,
        mgr: &mut M,
        va: usize,
    ) -> Option<(usize, VmFlags<Meta>)> {
        let pte = unsafe { self.walk(mgr, va, false)?.read() };
        if !pte.is_valid() {
            return None;
        }
        Some((pte.ppn().val() << PAGE_BITS, pte.flags()))
    }

    /// 用户可访问叶（V 且 U）对应的物理页地址。
    pub fn walk_addr<M: PageManager<Meta>>(&self, mgr: &mut M, va: usize) -> Option<usize> {
        if va >= MAXVA {
            return None;
        }
        let (pa, fl) = self.translate(mgr, va)?;
        if !fl.contains(flags("U")) {
            return None;
        }
        Some(pa)
    }

    /// 将 `[pa, pa+size)` 映射到 `[va, va+size)`。`perm` 必须含 V。
    /// 目标叶已存在视为内核错误；中间页表分配失败返回 Err，
    /// 已写入的叶留给调用方回滚。
    pub fn map_pages<M: PageManager<Meta>>(
        &self,
        mgr: &mut M,
        va: usize,
        size: usize,
        pa: usize,
        perm: VmFlags<Meta>,
    ) -> Result<(), ()> {
        assert!(size > 0, "map_pages");
        let mut a = page_round_down(va);
        let last = page_round_down(va + size - 1);
        let mut pa = page_round_down(pa);
        loop {
            let Some(pte_ptr) = self.walk(mgr, a, true) else {
                return Err(());
            };
            let pte = unsafe { pte_ptr.read() };
            assert!(!pte.is_valid(), "remap");
            unsafe { pte_ptr.write(perm.build_pte(PPN::new(pa >> PAGE_BITS))) };
            if a == last {
                break;
            }
            a += PAGE_SIZE;
            pa += PAGE_SIZE;
        }
        Ok(())
    }

    /// 清除从 va 起 npages 个叶映射；要求每个叶都存在且确为叶。
    /// `do_free` 时同时归还叶指向的物理页。
    pub fn unmap_pages<M: PageManager<Meta>>(
        &self,
        mgr: &mut M,
        va: usize,
        npages: usize,
        do_free: bool,
    ) {
        assert!(va % PAGE_SIZE == 0, "unmap_pages: not aligned");
        for i in 0..npages {
            let a = va + i * PAGE_SIZE;
            let pte_ptr = self.walk(mgr, a, false).expect("unmap_pages: walk");
            let pte = unsafe { pte_ptr.read() };
            assert!(pte.is_valid(), "unmap_pages: not mapped");
            assert!(is_leaf(pte), "unmap_pages: not a leaf");
            if do_free {
                mgr.deallocate(pte.ppn());
            }
            unsafe { pte_ptr.write(empty_pte()) };
        }
    }
}

// =============================================================================
// 用户地址空间操作（upt/kpt 成对维护）
// =============================================================================

/// 分配一个空根页作为新的用户页表。
pub fn uvm_create<Meta: VmMeta, M: PageManager<Meta>>(mgr: &mut M) -> Option<PageTable<Meta>> {
    Some(PageTable::new(mgr.allocate()?))
}

/// 把 `src` 装入一个新页并映射到两张表的虚地址 0。
/// 只用于装载首进程的 initcode，超过一页视为内核错误。
pub fn uvm_init<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    upt: PageTable<Meta>,
    kpt: PageTable<Meta>,
    src: &[u8],
) {
    assert!(src.len() < PAGE_SIZE, "uvm_init: more than a page");
    let mem = mgr.allocate().expect("uvm_init: out of memory");
    let pa = mem.val() << PAGE_BITS;
    upt.map_pages(mgr, 0, PAGE_SIZE, pa, flags("VRWXU"))
        .expect("uvm_init");
    kpt.map_pages(mgr, 0, PAGE_SIZE, pa, flags("VRWX"))
        .expect("uvm_init");
    unsafe {
        core::ptr::copy_nonoverlapping(src.as_ptr(), mgr.p_to_v::<u8>(mem).as_ptr(), src.len());
    }
}

/// 把两张表的用户空间从 oldsz 扩到 newsz，每页新配物理页。
/// 失败时回滚到 oldsz 并返回 None；成功返回 newsz。
pub fn uvm_alloc<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    upt: PageTable<Meta>,
    kpt: PageTable<Meta>,
    oldsz: usize,
    newsz: usize,
) -> Option<usize> {
    if newsz < oldsz {
        return Some(oldsz);
    }
    if newsz > MAXUVA {
        return None;
    }
    let oldsz = page_round_up(oldsz);
    let mut a = oldsz;
    while a < newsz {
        let Some(mem) = mgr.allocate() else {
            uvm_dealloc(mgr, upt, kpt, a, oldsz);
            return None;
        };
        let pa = mem.val() << PAGE_BITS;
        if upt.map_pages(mgr, a, PAGE_SIZE, pa, flags("VRWXU")).is_err() {
            mgr.deallocate(mem);
            uvm_dealloc(mgr, upt, kpt, a, oldsz);
            return None;
        }
        if kpt.map_pages(mgr, a, PAGE_SIZE, pa, flags("VRWX")).is_err() {
            let npages = (a - oldsz) / PAGE_SIZE;
            upt.unmap_pages(mgr, oldsz, npages + 1, true);
            if npages > 0 {
                kpt.unmap_pages(mgr, oldsz, npages, false);
            }
            return None;
        }
        a += PAGE_SIZE;
    }
    Some(newsz)
}

/// 把两张表的用户空间从 oldsz 缩到 newsz：
/// kpt 只取消映射，upt 取消映射并释放物理页。
pub fn uvm_dealloc<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    upt: PageTable<Meta>,
    kpt: PageTable<Meta>,
    oldsz: usize,
    newsz: usize,
) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }
    let new_top = page_round_up(newsz);
    let old_top = page_round_up(oldsz);
    if new_top < old_top {
        let npages = (old_top - new_top) / PAGE_SIZE;
        kpt.unmap_pages(mgr, new_top, npages, false);
        upt.unmap_pages(mgr, new_top, npages, true);
    }
    newsz
}

/// 把 `old_upt` 的前 sz 字节深拷贝进 `new_upt`/`new_kpt`。
/// 本内核的用户页一律以 U|R|W|X 映射（uvm_init/uvm_alloc 只产生这种页），
/// 子进程按同一权限集映射，kpt 一侧去掉 U。失败时回滚。
pub fn uvm_copy<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    old_upt: PageTable<Meta>,
    new_upt: PageTable<Meta>,
    new_kpt: PageTable<Meta>,
    sz: usize,
) -> Result<(), ()> {
    let mut i = 0;
    let mut ki = 0;
    while i < sz {
        let pte_ptr = old_upt.walk(mgr, i, false).expect("uvm_copy: pte should exist");
        let pte = unsafe { pte_ptr.read() };
        assert!(pte.is_valid(), "uvm_copy: page not present");
        let src = mgr.p_to_v::<u8>(pte.ppn()).as_ptr();

        let rollback = |mgr: &mut M, i: usize, ki: usize| {
            if ki > 0 {
                new_kpt.unmap_pages(mgr, 0, ki / PAGE_SIZE, false);
            }
            if i > 0 {
                new_upt.unmap_pages(mgr, 0, i / PAGE_SIZE, true);
            }
        };

        let Some(mem) = mgr.allocate() else {
            rollback(mgr, i, ki);
            return Err(());
        };
        unsafe {
            core::ptr::copy_nonoverlapping(src, mgr.p_to_v::<u8>(mem).as_ptr(), PAGE_SIZE);
        }
        let pa = mem.val() << PAGE_BITS;
        if new_upt.map_pages(mgr, i, PAGE_SIZE, pa, flags("VRWXU")).is_err() {
            mgr.deallocate(mem);
            rollback(mgr, i, ki);
            return Err(());
        }
        i += PAGE_SIZE;
        if new_kpt.map_pages(mgr, ki, PAGE_SIZE, pa, flags("VRWX")).is_err() {
            rollback(mgr, i, ki);
            return Err(());
        }
        ki += PAGE_SIZE;
    }
    Ok(())
}

/// 清除一个用户叶的 U 权限（用户栈守护页）。
/// 本内核用户叶权限恒为 U|R|W|X，直接改写为 R|W|X。
pub fn uvm_clear<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    upt: PageTable<Meta>,
    va: usize,
) {
    let pte_ptr = upt.walk(mgr, va, false).expect("uvm_clear");
    let pte = unsafe { pte_ptr.read() };
    assert!(pte.is_valid(), "uvm_clear");
    unsafe { pte_ptr.write(flags::<Meta>("VRWX").build_pte(pte.ppn())) };
}

/// 递归释放页表占用的所有中间页。到达此处时叶映射必须已全部清除。
pub fn free_walk<Meta: VmMeta, M: PageManager<Meta>>(mgr: &mut M, pt: PageTable<Meta>) {
    let table: *mut Pte<Meta> = mgr.p_to_v(pt.root).as_ptr();
    for i in 0..NENTRY {
        let pte_ptr = unsafe { table.add(i) };
        let pte = unsafe { pte_ptr.read() };
        if pte.is_valid() {
            assert!(!is_leaf(pte), "free_walk: leaf");
            free_walk(mgr, PageTable::new(pte.ppn()));
            unsafe { pte_ptr.write(empty_pte()) };
        }
    }
    mgr.deallocate(pt.root);
}

/// 释放用户页表：先解除并回收 [0, sz) 的叶映射，再拆除页表树。
pub fn uvm_free<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    upt: PageTable<Meta>,
    sz: usize,
) {
    if sz > 0 {
        upt.unmap_pages(mgr, 0, page_round_up(sz) / PAGE_SIZE, true);
    }
    free_walk(mgr, upt);
}

// =============================================================================
// 进程内核页表
// =============================================================================

/// 复制内核根页得到一张进程内核页表：所有顶级项与内核共享。
/// 调用方随后在 VKSTACK 映射私有内核栈。
pub fn kvm_clone<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    kernel: PageTable<Meta>,
) -> Option<PageTable<Meta>> {
    let root = mgr.allocate()?;
    unsafe {
        core::ptr::copy_nonoverlapping(
            mgr.p_to_v::<u8>(kernel.root_ppn()).as_ptr(),
            mgr.p_to_v::<u8>(root).as_ptr(),
            PAGE_SIZE,
        );
    }
    Some(PageTable::new(root))
}

/// 释放子页表但不触碰叶指向的物理页（它们属于 upt 或内核）。
fn kfree_walk<Meta: VmMeta, M: PageManager<Meta>>(mgr: &mut M, pt: PageTable<Meta>) {
    let table: *mut Pte<Meta> = mgr.p_to_v(pt.root).as_ptr();
    for i in 0..NENTRY {
        let pte_ptr = unsafe { table.add(i) };
        let pte = unsafe { pte_ptr.read() };
        if pte.is_valid() && !is_leaf(pte) {
            kfree_walk(mgr, PageTable::new(pte.ppn()));
            unsafe { pte_ptr.write(empty_pte()) };
        }
    }
    mgr.deallocate(pt.root);
}

/// 释放进程内核页表。`stack_free` 时先解除 VKSTACK 映射并回收栈页。
/// 只拆除用户区间与内核栈区间的私有子树；与内核共享的顶级项原样留下。
pub fn kvm_free<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    kpt: PageTable<Meta>,
    stack_free: bool,
) {
    let table: *mut Pte<Meta> = mgr.p_to_v(kpt.root).as_ptr();
    if stack_free {
        kpt.unmap_pages(mgr, VKSTACK, 1, true);
        let idx = px(2, VKSTACK);
        let pte_ptr = unsafe { table.add(idx) };
        let pte = unsafe { pte_ptr.read() };
        if pte.is_valid() && !is_leaf(pte) {
            kfree_walk(mgr, PageTable::new(pte.ppn()));
            unsafe { pte_ptr.write(empty_pte()) };
        }
    }
    for i in 0..px(2, MAXUVA) {
        let pte_ptr = unsafe { table.add(i) };
        let pte = unsafe { pte_ptr.read() };
        if pte.is_valid() && !is_leaf(pte) {
            kfree_walk(mgr, PageTable::new(pte.ppn()));
            unsafe { pte_ptr.write(empty_pte()) };
        }
    }
    mgr.deallocate(kpt.root);
}

// =============================================================================
// 用户内存拷贝
// =============================================================================

/// 逐页解析 upt，把 `src` 拷入外部进程的 `[dstva, dstva+len)`。
pub fn copy_out<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    upt: PageTable<Meta>,
    mut dstva: usize,
    src: &[u8],
) -> Result<(), ()> {
    let mut src = src;
    while !src.is_empty() {
        let va0 = page_round_down(dstva);
        let pa0 = upt.walk_addr(mgr, va0).ok_or(())?;
        let n = (PAGE_SIZE - (dstva - va0)).min(src.len());
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr(),
                (pa0 + (dstva - va0)) as *mut u8,
                n,
            );
        }
        src = &src[n..];
        dstva = va0 + PAGE_SIZE;
    }
    Ok(())
}

/// 逐页解析 upt，把外部进程的 `[srcva, srcva+len)` 拷入 `dst`。
pub fn copy_in<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    upt: PageTable<Meta>,
    dst: &mut [u8],
    mut srcva: usize,
) -> Result<(), ()> {
    let mut dst = dst;
    while !dst.is_empty() {
        let va0 = page_round_down(srcva);
        let pa0 = upt.walk_addr(mgr, va0).ok_or(())?;
        let n = (PAGE_SIZE - (srcva - va0)).min(dst.len());
        unsafe {
            core::ptr::copy_nonoverlapping(
                (pa0 + (srcva - va0)) as *const u8,
                dst.as_mut_ptr(),
                n,
            );
        }
        dst = &mut dst[n..];
        srcva = va0 + PAGE_SIZE;
    }
    Ok(())
}

/// 逐页解析 upt 拷贝 NUL 结尾字符串，返回不含 NUL 的长度。
/// 超出 `dst` 容量仍未遇到 NUL 返回 Err。
pub fn copy_in_str<Meta: VmMeta, M: PageManager<Meta>>(
    mgr: &mut M,
    upt: PageTable<Meta>,
    dst: &mut [u8],
    mut srcva: usize,
) -> Result<usize, ()> {
    let mut copied = 0;
    while copied < dst.len() {
        let va0 = page_round_down(srcva);
        let pa0 = upt.walk_addr(mgr, va0).ok_or(())?;
        let in_page = PAGE_SIZE - (srcva - va0);
        for i in 0..in_page {
            if copied >= dst.len() {
                return Err(());
            }
            let byte = unsafe { *((pa0 + (srcva - va0) + i) as *const u8) };
            dst[copied] = byte;
            if byte == 0 {
                return Ok(copied);
            }
            copied += 1;
        }
        srcva = va0 + PAGE_SIZE;
    }
    Err(())
}

/// 借助当前装载的 kpt 直接写当前进程的用户内存。
/// 仅作越界检查，随后按普通地址访问。
///
/// # Safety
/// 当前 satp 必须指向该进程的 kpt，且 `sz` 为其用户空间大小。
pub unsafe fn copy_out2(sz: usize, dstva: usize, src: &[u8]) -> Result<(), ()> {
    let end = dstva.checked_add(src.len()).ok_or(())?;
    if end > sz || dstva >= sz {
        return Err(());
    }
    core::ptr::copy_nonoverlapping(src.as_ptr(), dstva as *mut u8, src.len());
    Ok(())
}

/// 借助当前装载的 kpt 直接读当前进程的用户内存。
///
/// # Safety
/// 同 [`copy_out2`]。
pub unsafe fn copy_in2(sz: usize, dst: &mut [u8], srcva: usize) -> Result<(), ()> {
    let end = srcva.checked_add(dst.len()).ok_or(())?;
    if end > sz || srcva >= sz {
        return Err(());
    }
    core::ptr::copy_nonoverlapping(srcva as *const u8, dst.as_mut_ptr(), dst.len());
    Ok(())
}

/// 直接读当前进程用户内存中的 NUL 结尾字符串。
///
/// # Safety
/// 同 [`copy_out2`]。
pub unsafe fn copy_in_str2(sz: usize, dst: &mut [u8], srcva: usize) -> Result<usize, ()> {
    let mut i = 0;
    let mut va = srcva;
    while va < sz && i < dst.len() {
        let byte = *(va as *const u8);
        dst[i] = byte;
        if byte == 0 {
            return Ok(i);
        }
        i += 1;
        va += 1;
    }
    Err(())
}
