//! kernel-alloc: 内核堆与物理页帧分配
//!
//! 堆分配器基于 buddy allocator，通过 `#[global_allocator]` 服务 `alloc` 容器；
//! 页帧分配器维护内核镜像末尾到物理内存顶之间的整页空闲链表。

#![cfg_attr(not(test), no_std)]

#[cfg(not(test))]
extern crate alloc;

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use customizable_buddy::{BuddyAllocator, LinkedListBuddy, UsizeBuddy};

#[cfg(not(test))]
use alloc::alloc::{handle_alloc_error, Layout};
#[cfg(not(test))]
use core::alloc::GlobalAlloc;

pub mod frames;

/// 伙伴分配器：阶数 21，最大可管理约 2^30 字节。
type Buddy = BuddyAllocator<21, UsizeBuddy, LinkedListBuddy>;

/// 无锁包装。调用方保证不存在并发的 alloc/dealloc/transfer：
/// 堆初始化发生在副核放行之前，此后所有分配都经过全局分配器的内部串行化点。
struct BuddyCell(UnsafeCell<Buddy>);

unsafe impl Sync for BuddyCell {}

static BUDDY: BuddyCell = BuddyCell(UnsafeCell::new(BuddyAllocator::new()));

/// 初始化全局堆分配器。
///
/// `base_address` 非零，且在内核地址空间中可写。
/// 必须在首次堆分配或 `transfer` 之前由 0 号核调用一次。
pub fn init_heap(base_address: usize) {
    let base = NonNull::new(base_address as *mut u8).unwrap();
    const MIN_ORDER: usize = 6;
    unsafe {
        (*BUDDY.0.get()).init(MIN_ORDER, base);
    }
}

/// 将一段内存托管给全局堆分配器。
///
/// # Safety
///
/// 必须已调用过 `init_heap`；`region` 与已托管区域不重叠、
/// 未被其他对象引用、按 2^6 字节对齐。
pub unsafe fn transfer(region: &'static mut [u8]) {
    let ptr = NonNull::new(region.as_mut_ptr()).unwrap();
    (*BUDDY.0.get()).transfer(ptr, region.len());
}

#[allow(dead_code)]
struct KernelAlloc;

/// 测试二进制没有内核内存可托管，用系统分配器顶替。
#[cfg(test)]
#[global_allocator]
static ALLOC: std::alloc::System = std::alloc::System;

#[cfg(not(test))]
#[global_allocator]
static ALLOC: KernelAlloc = KernelAlloc;

#[cfg(not(test))]
unsafe impl GlobalAlloc for KernelAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match (*BUDDY.0.get()).allocate_layout::<u8>(layout) {
            Ok((ptr, _)) => ptr.as_ptr(),
            Err(_) => handle_alloc_error(layout),
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(non_null) = NonNull::new(ptr) {
            (*BUDDY.0.get()).deallocate_layout(non_null, layout);
        }
    }
}
