//! kernel-alloc crate 功能性验证测试
//!
//! 页帧分配器在一块泄漏的对齐内存上验证；
//! 堆分配器（buddy）只在内核目标上充当全局分配器，这里不重复测试。

use kernel_alloc::frames::{FrameAllocator, PAGE_SIZE};
use std::alloc::{alloc, Layout};
use std::collections::HashSet;

// 本测试二进制链接的 kernel-alloc 以非 test 配置编译，
// buddy 堆就是进程的全局分配器，必须在 main 之前托管一块内存。
#[repr(C, align(4096))]
struct HeapRegion([u8; 32 << 20]);

static mut HEAP_REGION: HeapRegion = HeapRegion([0; 32 << 20]);

#[ctor::ctor]
fn init_global_heap() {
    unsafe {
        let base = HEAP_REGION.0.as_mut_ptr() as usize;
        kernel_alloc::init_heap(base);
        kernel_alloc::transfer(&mut HEAP_REGION.0);
    }
}

const REGION_PAGES: usize = 64;

/// 泄漏一块页对齐的内存充当"物理内存"。
fn leak_region(pages: usize) -> (usize, usize) {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc(layout) };
    assert!(!ptr.is_null());
    let start = ptr as usize;
    (start, start + pages * PAGE_SIZE)
}

fn make_allocator(pages: usize) -> FrameAllocator {
    let (start, end) = leak_region(pages);
    let fa = FrameAllocator::new();
    unsafe { fa.init(start, end) };
    fa
}

#[test]
fn test_init_free_amount() {
    let fa = make_allocator(REGION_PAGES);
    assert_eq!(fa.free_amount(), REGION_PAGES * PAGE_SIZE);
}

#[test]
fn test_alloc_is_aligned_and_poisoned() {
    let fa = make_allocator(8);
    let pa = fa.alloc().unwrap();
    assert_eq!(pa % PAGE_SIZE, 0);
    // 分配出的页应填充 0x05
    let page = unsafe { std::slice::from_raw_parts(pa as *const u8, PAGE_SIZE) };
    assert!(page.iter().all(|&b| b == 0x05));
}

#[test]
fn test_alloc_unique_until_freed() {
    // 连续分配不会返回重复页
    let fa = make_allocator(16);
    let mut seen = HashSet::new();
    let mut held = Vec::new();
    while let Some(pa) = fa.alloc() {
        assert!(seen.insert(pa));
        held.push(pa);
    }
    assert_eq!(held.len(), 16);
    assert_eq!(fa.free_amount(), 0);
}

#[test]
fn test_free_then_alloc_roundtrip() {
    // kfree(kalloc()) 之后仍能分配到页
    let fa = make_allocator(4);
    let pa = fa.alloc().unwrap();
    unsafe { fa.free(pa) };
    assert_eq!(fa.free_amount(), 4 * PAGE_SIZE);
    let pa2 = fa.alloc().unwrap();
    // 链表头复用刚释放的页
    assert_eq!(pa2, pa);
}

#[test]
fn test_exhaustion_returns_none() {
    let fa = make_allocator(2);
    let a = fa.alloc().unwrap();
    let b = fa.alloc().unwrap();
    assert!(fa.alloc().is_none());
    unsafe {
        fa.free(a);
        fa.free(b);
    }
    assert!(fa.alloc().is_some());
}

#[test]
#[should_panic(expected = "kfree")]
fn test_free_unaligned_panics() {
    let fa = make_allocator(2);
    let pa = fa.alloc().unwrap();
    unsafe { fa.free(pa + 8) };
}

#[test]
#[should_panic(expected = "kfree")]
fn test_free_out_of_range_panics() {
    let fa = make_allocator(2);
    let (other, _) = leak_region(1);
    let _keep = fa.alloc().unwrap();
    unsafe { fa.free(other) };
}
