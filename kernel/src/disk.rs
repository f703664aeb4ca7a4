//! virtio-blk 磁盘。
//!
//! 请求由驱动轮询完成，缓冲块的睡眠锁保证同一时刻只有一个
//! 扇区在途；disk_intr 只负责应答设备中断。

use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use alloc::sync::Arc;
use fat32_fs::BlockDevice;
use spin::Lazy;
use sync::SpinLock;
use virtio_drivers::{Hal, VirtIOBlk, VirtIOHeader};

use crate::{MMIO_OFFSET, VIRTIO0};

const PAGE_SIZE: usize = 4096;

struct VirtioHal;

impl Hal for VirtioHal {
    fn dma_alloc(pages: usize) -> usize {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        // 内核堆在恒等映射区，虚即是实
        ptr as usize
    }

    fn dma_dealloc(paddr: usize, pages: usize) -> i32 {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { dealloc(paddr as *mut u8, layout) };
        0
    }

    fn phys_to_virt(paddr: usize) -> usize {
        paddr
    }

    fn virt_to_phys(vaddr: usize) -> usize {
        vaddr
    }
}

pub struct Disk(SpinLock<VirtIOBlk<'static, VirtioHal>>);

impl Disk {
    fn new() -> Self {
        let header = unsafe { &mut *((VIRTIO0 + MMIO_OFFSET) as *mut VirtIOHeader) };
        let blk = VirtIOBlk::<VirtioHal>::new(header).expect("failed to init virtio-blk");
        Self(SpinLock::new(blk))
    }

    pub fn ack_intr(&self) {
        self.0.lock().ack_interrupt();
    }
}

impl BlockDevice for Disk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.0
            .lock()
            .read_block(block_id, buf)
            .expect("virtio read block failed");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.0
            .lock()
            .write_block(block_id, buf)
            .expect("virtio write block failed");
    }
}

static DISK: Lazy<Arc<Disk>> = Lazy::new(|| Arc::new(Disk::new()));

pub fn block_device() -> Arc<dyn BlockDevice> {
    DISK.clone()
}

/// 设备中断应答。
pub fn disk_intr() {
    DISK.ack_intr();
}
