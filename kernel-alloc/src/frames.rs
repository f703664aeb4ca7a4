//! 物理页帧分配器：整页粒度的空闲链表。
//!
//! 链表节点藏在空闲页自身头部。空闲页填充 0x01、分配页填充 0x05，
//! 以便尽早暴露使用已释放页的错误。

use core::ptr;
use sync::SpinLock;

pub const PAGE_SIZE: usize = 4096;

const FREE_POISON: u8 = 0x01;
const ALLOC_POISON: u8 = 0x05;

struct FrameList {
    /// 空闲链表头页的物理地址，0 表示空。
    head: usize,
    npage: usize,
    start: usize,
    end: usize,
}

/// 页帧分配器。管理 `[start, end)` 之间的所有整页，
/// 每一页要么在空闲链表中，要么归属唯一持有者。
pub struct FrameAllocator {
    inner: SpinLock<FrameList>,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(FrameList {
                head: 0,
                npage: 0,
                start: 0,
                end: 0,
            }),
        }
    }

    /// 接管 `[start, end)`，把其中的整页全部挂入空闲链表。
    ///
    /// # Safety
    ///
    /// 区间必须在当前地址空间中可写，且未被任何对象引用。
    pub unsafe fn init(&self, start: usize, end: usize) {
        let first = round_up(start);
        {
            let mut inner = self.inner.lock();
            inner.start = first;
            inner.end = end;
        }
        let mut page = first;
        while page + PAGE_SIZE <= end {
            self.free(page);
            page += PAGE_SIZE;
        }
    }

    /// 取出一页，内容为分配毒值。耗尽时返回 None。
    pub fn alloc(&self) -> Option<usize> {
        let pa = {
            let mut inner = self.inner.lock();
            let pa = inner.head;
            if pa == 0 {
                return None;
            }
            inner.head = unsafe { ptr::read(pa as *const usize) };
            inner.npage -= 1;
            pa
        };
        unsafe { ptr::write_bytes(pa as *mut u8, ALLOC_POISON, PAGE_SIZE) };
        Some(pa)
    }

    /// 归还一页。未对齐或越界视为内核错误。
    ///
    /// # Safety
    ///
    /// `pa` 必须来自本分配器的 `alloc` 且此后未被归还。
    pub unsafe fn free(&self, pa: usize) {
        {
            let inner = self.inner.lock();
            assert!(
                pa % PAGE_SIZE == 0 && pa >= inner.start && pa + PAGE_SIZE <= inner.end,
                "kfree"
            );
        }
        ptr::write_bytes(pa as *mut u8, FREE_POISON, PAGE_SIZE);
        let mut inner = self.inner.lock();
        ptr::write(pa as *mut usize, inner.head);
        inner.head = pa;
        inner.npage += 1;
    }

    /// 空闲内存总量（字节）。
    pub fn free_amount(&self) -> usize {
        self.inner.lock().npage * PAGE_SIZE
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
