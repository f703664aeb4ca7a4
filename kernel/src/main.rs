//! 面向 QEMU virt 的双核教学内核：
//! 进程隔离在各自的用户页表里，内核以进程内核页表直接访问用户内存，
//! 文件系统是 virtio 磁盘上的 FAT32。

#![no_std]
#![no_main]

extern crate alloc;

mod console;
mod disk;
mod exec;
mod file;
mod kvm;
mod plic;
mod proc;
mod syscall;
mod timer;
mod trap;

use core::hint::spin_loop;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_console::{println, set_log_level};
use linker::KernelLayout;
use sbi_rt::{NoReason, Shutdown, SystemFailure};

linker::boot0!(rust_main; stack = 16 * 4096; harts = 2);

pub const NCPU: usize = 2;
pub const NPROC: usize = 50;
pub const NOFILE: usize = 16;

/// QEMU virt：128 MiB 物理内存。
pub const PHYS_MEM_TOP: usize = 0x8800_0000;
/// MMIO 统一映射到物理地址加此偏移，避开用户与内核栈的顶级页表项。
pub const MMIO_OFFSET: usize = 0x1_0000_0000;
pub const VIRTIO0: usize = 0x1000_1000;
pub const PLIC_BASE: usize = 0x0c00_0000;
pub const UART0_IRQ: u32 = 10;
pub const VIRTIO0_IRQ: u32 = 1;

/// 内核堆大小；其余空闲内存交给页帧分配器。
const HEAP_SIZE: usize = 16 << 20;

static STARTED: AtomicBool = AtomicBool::new(false);
static FIRST_HART: AtomicBool = AtomicBool::new(true);

#[no_mangle]
extern "C" fn rust_main(hartid: usize) -> ! {
    if FIRST_HART.swap(false, Ordering::SeqCst) {
        unsafe { KernelLayout::locate().zero_bss() };
        kernel_console::init_console(&console::SbiConsole);
        set_log_level(option_env!("LOG"));

        let layout = KernelLayout::locate();
        let heap_start = layout.end();
        kernel_alloc::init_heap(heap_start);
        unsafe {
            kernel_alloc::transfer(core::slice::from_raw_parts_mut(
                heap_start as *mut u8,
                HEAP_SIZE,
            ));
            kvm::KMEM.init(heap_start + HEAP_SIZE, PHYS_MEM_TOP);
        }

        kvm::init();
        kvm::init_hart();
        proc::init();
        trap::init_hart();
        plic::init();
        plic::init_hart();
        file::init();
        sync::init_suspend(&proc::PROC_SUSPEND);
        proc::userinit();
        log::info!(
            "hart {} init done, {} KiB frames free",
            hartid,
            kvm::KMEM.free_amount() / 1024
        );

        for h in 0..NCPU {
            if h != hartid {
                sbi_rt::hart_start(h, _start as usize, 0);
            }
        }
        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {
            spin_loop();
        }
        kvm::init_hart();
        trap::init_hart();
        plic::init_hart();
        log::info!("hart {} init done", hartid);
    }

    proc::scheduler()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    sbi_rt::system_reset(Shutdown, SystemFailure);
    unreachable!()
}

#[allow(unused)]
fn shutdown() -> ! {
    sbi_rt::system_reset(Shutdown, NoReason);
    unreachable!()
}
