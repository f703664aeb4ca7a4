//! 内核页表与页帧管理的接线。
//!
//! 页帧分配器承包内核堆之后的全部空闲内存；`Frames` 把它接到
//! kernel-vm 的 `PageManager` 上（内核恒等映射，页号即地址右移）。

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_alloc::frames::FrameAllocator;
use kernel_vm::page_table::{Sv39, VmFlags, PPN};
use kernel_vm::{PageManager, PageTable, PAGE_SIZE, TRAMPOLINE};
use linker::{KernelLayout, KernelRegionTitle};
use spin::Once;

use crate::{MMIO_OFFSET, PLIC_BASE, VIRTIO0};

pub static KMEM: FrameAllocator = FrameAllocator::new();

/// 页帧分配器背后的 `PageManager`。零尺寸：状态都在 KMEM 里。
pub struct Frames;

impl PageManager<Sv39> for Frames {
    fn allocate(&mut self) -> Option<PPN<Sv39>> {
        let pa = KMEM.alloc()?;
        // 页表与用户页都要求零页
        unsafe { core::ptr::write_bytes(pa as *mut u8, 0, PAGE_SIZE) };
        Some(PPN::new(pa >> 12))
    }

    fn deallocate(&mut self, ppn: PPN<Sv39>) {
        unsafe { KMEM.free(ppn.val() << 12) };
    }

    fn p_to_v<T>(&self, ppn: PPN<Sv39>) -> NonNull<T> {
        NonNull::new((ppn.val() << 12) as *mut T).unwrap()
    }

    fn v_to_p<T>(&self, ptr: NonNull<T>) -> PPN<Sv39> {
        PPN::new(ptr.as_ptr() as usize >> 12)
    }
}

static KERNEL_PT: Once<PageTable<Sv39>> = Once::new();
static KERNEL_SATP: AtomicUsize = AtomicUsize::new(0);

pub fn kernel_pagetable() -> PageTable<Sv39> {
    *KERNEL_PT.get().expect("kvm::init first")
}

pub fn kernel_satp() -> usize {
    KERNEL_SATP.load(Ordering::Relaxed)
}

pub fn make_satp(pt: &PageTable<Sv39>) -> usize {
    (8 << 60) | pt.root_ppn().val()
}

fn map(pt: PageTable<Sv39>, va: usize, pa: usize, size: usize, flags: &str) {
    pt.map_pages(&mut Frames, va, size, pa, VmFlags::build_from_str(flags))
        .expect("kvmmap");
}

/// 建内核页表：内核各段按权限恒等映射，空闲内存可读写，
/// MMIO 整体平移 MMIO_OFFSET，跳板页映射到地址空间顶端。
pub fn init() {
    let layout = KernelLayout::locate();
    let pt = kernel_vm::uvm_create(&mut Frames).expect("kvm: out of memory");

    for region in layout.iter() {
        let flags = match region.title {
            KernelRegionTitle::Text => "VRX",
            KernelRegionTitle::Rodata => "VR",
            KernelRegionTitle::Data => "VRW",
            KernelRegionTitle::Boot => "VRW",
        };
        let size = region.range.end - region.range.start;
        if size > 0 {
            map(pt, region.range.start, region.range.start, size, flags);
        }
    }

    // 内核镜像之后的全部物理内存（堆与页帧）
    map(
        pt,
        layout.end(),
        layout.end(),
        crate::PHYS_MEM_TOP - layout.end(),
        "VRW",
    );

    // 外设
    map(pt, PLIC_BASE + MMIO_OFFSET, PLIC_BASE, 0x40_0000, "VRW");
    map(pt, VIRTIO0 + MMIO_OFFSET, VIRTIO0, PAGE_SIZE, "VRW");

    // 跳板页
    extern "C" {
        fn trampoline();
    }
    map(pt, TRAMPOLINE, trampoline as usize, PAGE_SIZE, "VRX");

    KERNEL_SATP.store(make_satp(&pt), Ordering::Relaxed);
    KERNEL_PT.call_once(|| pt);
}

/// 本核装载内核页表。
pub fn init_hart() {
    unsafe {
        riscv::register::satp::write(kernel_satp());
        core::arch::asm!("sfence.vma zero, zero");
    }
}
