//! 进程核心：槽位分配、双页表构建、fork/exit/wait、
//! 每核调度循环与 sleep/wakeup。
//!
//! 锁的交接规则：让出处理器的一方持有自己槽位的锁跨过 `swtch`，
//! 对侧（调度器或被唤醒的进程）负责释放，因此这里对槽位锁使用
//! 原始 acquire/release 而不是守卫。

use alloc::sync::Arc;
use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kernel_console::println;
use kernel_vm::page_table::Sv39;
use kernel_vm::{
    copy_out2, uvm_alloc, uvm_copy, uvm_create, uvm_dealloc, uvm_free, uvm_init, free_walk,
    kvm_clone, kvm_free, PageTable, PAGE_SIZE, TRAMPOLINE, TRAPFRAME, VKSTACK,
};
use proc_manage::{Context, Cpu, CpuTable, Proc, ProcShared, ProcState, ProcTable, TrapFrame};
use spin::Lazy;
use sync::{RawSpinLock, SpinGuard};

use crate::file::{self, File};
use crate::kvm::{self, Frames, KMEM};
use crate::{disk, trap, NCPU, NOFILE, NPROC};

/// 内核注入每个进程槽位的资源束。
pub struct ProcRes {
    pub upt: PageTable<Sv39>,
    pub kpt: PageTable<Sv39>,
    /// trapframe 页的物理地址，映射在 upt 的 TRAPFRAME 处。
    pub trapframe: usize,
    pub ofile: [Option<Arc<File>>; NOFILE],
    pub cwd: Option<fat32_fs::Ent>,
}

pub static PROC: Lazy<ProcTable<ProcRes, NPROC>> = Lazy::new(ProcTable::new);
pub static CPUS: Lazy<CpuTable<NCPU>> = Lazy::new(CpuTable::new);

static INIT_SLOT: AtomicUsize = AtomicUsize::new(usize::MAX);

/// 预热进程表与每核记录。必须在本核开中断之前完成，
/// 否则中断里的 wakeup 会撞上进行到一半的惰性初始化。
pub fn init() {
    Lazy::force(&PROC);
    Lazy::force(&CPUS);
}

global_asm!(
    r#"
    .section .text
    .globl swtch
swtch:  # swtch(save: *mut Context, load: *const Context)
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret
"#
);

extern "C" {
    fn swtch(save: *mut Context, load: *const Context);
}

/// 当前核正在运行的进程。
pub fn myproc() -> Option<(usize, &'static Proc<ProcRes>)> {
    sync::push_off();
    let slot = unsafe { CPUS.current() }.proc_slot;
    sync::pop_off();
    slot.map(|s| (s, PROC.slot(s)))
}

pub fn current_trapframe() -> *mut TrapFrame {
    let (_, p) = myproc().expect("no process");
    let owned = unsafe { p.owned() };
    owned.res.as_ref().unwrap().trapframe as *mut TrapFrame
}

pub fn current_sz() -> usize {
    let (_, p) = myproc().expect("no process");
    unsafe { p.owned() }.sz
}

pub fn current_killed() -> bool {
    let (_, p) = myproc().expect("no process");
    unsafe { &*p.shared.data_ptr() }.killed
}

pub fn set_current_killed() {
    let (_, p) = myproc().expect("no process");
    let mut g = p.shared.lock();
    g.killed = true;
}

/// 建用户页表：只映射跳板页与 trapframe 页，用户段由装载方补。
pub(crate) fn proc_pagetable(trapframe: usize) -> Option<PageTable<Sv39>> {
    extern "C" {
        fn trampoline();
    }
    let mut m = Frames;
    let upt = uvm_create(&mut m)?;
    if upt
        .map_pages(&mut m, TRAMPOLINE, PAGE_SIZE, trampoline as usize, flags("VRX"))
        .is_err()
    {
        free_walk(&mut m, upt);
        return None;
    }
    if upt
        .map_pages(&mut m, TRAPFRAME, PAGE_SIZE, trapframe, flags("VRW"))
        .is_err()
    {
        upt.unmap_pages(&mut m, TRAMPOLINE, 1, false);
        free_walk(&mut m, upt);
        return None;
    }
    Some(upt)
}

fn flags(s: &str) -> kernel_vm::page_table::VmFlags<Sv39> {
    kernel_vm::page_table::VmFlags::build_from_str(s)
}

/// 建进程内核页表：复制内核根页共享全部内核映射，
/// 再映射一页私有内核栈到 VKSTACK。
fn proc_kpagetable() -> Option<PageTable<Sv39>> {
    let mut m = Frames;
    let kpt = kvm_clone(&mut m, kvm::kernel_pagetable())?;
    let Some(stack) = KMEM.alloc() else {
        kvm_free(&mut m, kpt, false);
        return None;
    };
    if kpt
        .map_pages(&mut m, VKSTACK, PAGE_SIZE, stack, flags("VRW"))
        .is_err()
    {
        unsafe { KMEM.free(stack) };
        kvm_free(&mut m, kpt, false);
        return None;
    }
    Some(kpt)
}

/// 找一个空槽并配齐 trapframe、双页表与切换上下文。
/// 成功时仍持有槽位锁。
fn allocproc() -> Option<(usize, SpinGuard<'static, ProcShared>)> {
    let (idx, guard) = PROC.alloc_slot()?;
    let owned = unsafe { PROC.slot(idx).owned() };

    let Some(trapframe) = KMEM.alloc() else {
        return None;
    };
    let Some(upt) = proc_pagetable(trapframe) else {
        unsafe { KMEM.free(trapframe) };
        return None;
    };
    let Some(kpt) = proc_kpagetable() else {
        let mut m = Frames;
        upt.unmap_pages(&mut m, TRAMPOLINE, 1, false);
        upt.unmap_pages(&mut m, TRAPFRAME, 1, false);
        free_walk(&mut m, upt);
        unsafe { KMEM.free(trapframe) };
        return None;
    };

    owned.res = Some(ProcRes {
        upt,
        kpt,
        trapframe,
        ofile: core::array::from_fn(|_| None),
        cwd: None,
    });
    owned.kstack = VKSTACK;
    owned.sz = 0;
    owned.context = Context::ZERO;
    owned.context.ra = forkret as usize;
    owned.context.sp = VKSTACK + PAGE_SIZE;
    Some((idx, guard))
}

/// 释放槽位的全部资源并回到 Unused。调用方持有槽位锁。
/// 打开的文件与 cwd 必须已由 exit 关闭。
fn freeproc(idx: usize, shared: &mut ProcShared) {
    let owned = unsafe { PROC.slot(idx).owned() };
    let mut m = Frames;
    if let Some(res) = owned.res.take() {
        unsafe { KMEM.free(res.trapframe) };
        kvm_free(&mut m, res.kpt, true);
        res.upt.unmap_pages(&mut m, TRAMPOLINE, 1, false);
        res.upt.unmap_pages(&mut m, TRAPFRAME, 1, false);
        uvm_free(&mut m, res.upt, owned.sz);
    }
    owned.clear();
    shared.clear();
}

/// 首个用户进程的机器码：exec("/init") 失败则 exit。
static INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35,
    0x02, 0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00,
    0x00, 0x00, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// 装载首进程。0 号核启动末尾调用一次。
pub fn userinit() {
    let (idx, mut guard) = allocproc().expect("userinit: allocproc");
    INIT_SLOT.store(idx, Ordering::SeqCst);

    let owned = unsafe { PROC.slot(idx).owned() };
    let (upt, kpt, trapframe) = {
        let res = owned.res.as_ref().unwrap();
        (res.upt, res.kpt, res.trapframe)
    };
    let mut m = Frames;
    uvm_init(&mut m, upt, kpt, &INITCODE);
    owned.sz = PAGE_SIZE;

    let tf = trapframe as *mut TrapFrame;
    unsafe {
        (*tf).epc = 0;
        (*tf).sp = PAGE_SIZE;
    }
    owned.set_name(b"initcode");
    owned.tmask = 0;
    guard.state = ProcState::Runnable;
}

fn init_slot() -> usize {
    INIT_SLOT.load(Ordering::SeqCst)
}

/// 按 n 字节伸缩当前进程的用户空间。
pub fn growproc(n: isize) -> isize {
    let (_, p) = myproc().expect("growproc");
    let owned = unsafe { p.owned() };
    let res = owned.res.as_ref().unwrap();
    let sz = owned.sz;
    let mut m = Frames;
    let new_sz = if n > 0 {
        match uvm_alloc(&mut m, res.upt, res.kpt, sz, sz + n as usize) {
            Some(s) => s,
            None => return -1,
        }
    } else if n < 0 {
        let target = sz.saturating_sub((-n) as usize);
        uvm_dealloc(&mut m, res.upt, res.kpt, sz, target)
    } else {
        sz
    };
    owned.sz = new_sz;
    0
}

pub fn fork() -> isize {
    let (pslot, p) = myproc().expect("fork");
    let powned = unsafe { p.owned() };
    let pres = powned.res.as_ref().unwrap();

    let Some((cidx, mut cg)) = allocproc() else {
        return -1;
    };
    let cowned = unsafe { PROC.slot(cidx).owned() };
    let cres = cowned.res.as_mut().unwrap();

    let mut m = Frames;
    if uvm_copy(&mut m, pres.upt, cres.upt, cres.kpt, powned.sz).is_err() {
        freeproc(cidx, &mut cg);
        return -1;
    }
    cowned.sz = powned.sz;
    cowned.tmask = powned.tmask;
    cg.parent = Some(pslot);

    unsafe {
        *(cres.trapframe as *mut TrapFrame) = *(pres.trapframe as *const TrapFrame);
        // fork 在子进程中返回 0
        (*(cres.trapframe as *mut TrapFrame)).a0 = 0;
    }

    for i in 0..NOFILE {
        if let Some(f) = &pres.ofile[i] {
            cres.ofile[i] = Some(Arc::clone(f));
        }
    }
    cres.cwd = pres.cwd.as_ref().map(|c| file::fs().edup(c));
    cowned.name = powned.name;

    let pid = cg.pid;
    cg.state = ProcState::Runnable;
    drop(cg);
    pid
}

/// 结束当前进程：关文件、放 cwd、孤儿过继给 init、唤醒父进程，
/// 变为僵尸后进调度器不再回来。
pub fn exit(status: i32) -> ! {
    let (slot, p) = myproc().expect("exit");
    assert!(slot != init_slot(), "init exiting");

    let owned = unsafe { p.owned() };
    let res = owned.res.as_mut().unwrap();
    for f in res.ofile.iter_mut() {
        drop(f.take());
    }
    if let Some(cwd) = res.cwd.take() {
        file::fs().eput(cwd);
    }

    // init 可能在 wait 孤儿，唤一下
    let init = init_slot();
    {
        let mut g = PROC.slot(init).shared.lock();
        g.wake_if_waiting_on(PROC.slot_chan(init));
    }

    let parent = unsafe { &*p.shared.data_ptr() }.parent.expect("exit: no parent");

    let parent_raw = PROC.slot(parent).shared.raw();
    parent_raw.acquire();
    p.shared.raw().acquire();
    PROC.reparent(slot, init);
    unsafe { &mut *PROC.slot(parent).shared.data_ptr() }
        .wake_if_waiting_on(PROC.slot_chan(parent));

    let sh = unsafe { &mut *p.shared.data_ptr() };
    sh.xstate = status;
    sh.state = ProcState::Zombie;
    parent_raw.release();

    sched();
    unreachable!("zombie exit");
}

/// 等一个子进程退出，回收并返回其 pid；没有子进程返回 -1。
/// `addr` 非零时把退出码拷到用户空间。
pub fn wait(addr: usize) -> isize {
    let (slot, p) = myproc().expect("wait");
    p.shared.raw().acquire();
    loop {
        let mut havekids = false;
        for i in 0..NPROC {
            if i == slot {
                continue;
            }
            let np = PROC.slot(i);
            if unsafe { &*np.shared.data_ptr() }.parent != Some(slot) {
                continue;
            }
            let mut g = np.shared.lock();
            havekids = true;
            if g.state == ProcState::Zombie {
                let pid = g.pid;
                let xstate = g.xstate;
                if addr != 0 {
                    let sz = unsafe { p.owned() }.sz;
                    if unsafe { copy_out2(sz, addr, &xstate.to_ne_bytes()) }.is_err() {
                        drop(g);
                        p.shared.raw().release();
                        return -1;
                    }
                }
                freeproc(i, &mut g);
                drop(g);
                p.shared.raw().release();
                return pid;
            }
            drop(g);
        }

        let killed = unsafe { &*p.shared.data_ptr() }.killed;
        if !havekids || killed {
            p.shared.raw().release();
            return -1;
        }
        // 睡在自己槽位上，由 exit 定向唤醒
        sleep(PROC.slot_chan(slot), p.shared.raw());
    }
}

/// 每核调度循环：找 Runnable 的槽位，装载其内核页表并切过去；
/// 控制权回来时换回全局内核页表。整轮落空就 wfi 等中断。
pub fn scheduler() -> ! {
    let cpu_ptr: *mut Cpu = {
        sync::push_off();
        let c = unsafe { CPUS.current() } as *mut Cpu;
        sync::pop_off();
        c
    };

    loop {
        sync::enable_intr();

        let mut found = false;
        for idx in 0..NPROC {
            let p = PROC.slot(idx);
            let mut g = p.shared.lock();
            if g.state == ProcState::Runnable {
                g.state = ProcState::Running;
                let cpu = unsafe { &mut *cpu_ptr };
                cpu.proc_slot = Some(idx);

                let owned = unsafe { p.owned() };
                let satp = kvm::make_satp(&owned.res.as_ref().unwrap().kpt);
                unsafe {
                    riscv::register::satp::write(satp);
                    core::arch::asm!("sfence.vma zero, zero");
                    swtch(&mut cpu.context, &owned.context);
                    riscv::register::satp::write(kvm::kernel_satp());
                    core::arch::asm!("sfence.vma zero, zero");
                }

                unsafe { &mut *cpu_ptr }.proc_slot = None;
                found = true;
            }
            drop(g);
        }

        if !found {
            sync::enable_intr();
            unsafe { core::arch::asm!("wfi") };
        }
    }
}

/// 回到本核调度器。调用方持有且只持有自己槽位的锁，
/// 状态已不是 Running。
fn sched() {
    let (_, p) = myproc().expect("sched");
    assert!(p.shared.raw().holding(), "sched p->lock");
    assert!(sync::hart_noff() == 1, "sched locks");
    assert!(
        unsafe { &*p.shared.data_ptr() }.state != ProcState::Running,
        "sched running"
    );
    assert!(!sync::intr_enabled(), "sched interruptible");

    let intena = sync::hart_intena();
    let owned = unsafe { p.owned() };
    let cpu = unsafe { CPUS.current() };
    unsafe { swtch(&mut owned.context, &cpu.context) };
    sync::set_hart_intena(intena);
}

/// 主动让出处理器。
pub fn yield_now() {
    let (_, p) = myproc().expect("yield");
    p.shared.raw().acquire();
    unsafe { &mut *p.shared.data_ptr() }.state = ProcState::Runnable;
    sched();
    p.shared.raw().release();
}

/// 睡在 chan 上并释放 lk，醒来重新持有 lk。
/// 换锁相对唤醒者原子：先拿自己槽位的锁再放 lk。
pub fn sleep(chan: usize, lk: &RawSpinLock) {
    let (_, p) = myproc().expect("sleep");
    let own = p.shared.raw();
    let same = core::ptr::eq(own as *const _, lk as *const _);
    if !same {
        own.acquire();
        lk.release();
    }

    let sh = unsafe { &mut *p.shared.data_ptr() };
    sh.chan = chan;
    sh.state = ProcState::Sleeping;

    sched();

    unsafe { &mut *p.shared.data_ptr() }.chan = 0;

    if !same {
        own.release();
        lk.acquire();
    }
}

pub fn wakeup(chan: usize) {
    PROC.wakeup(chan);
}

pub fn kill(pid: isize) -> isize {
    if PROC.kill(pid) {
        0
    } else {
        -1
    }
}

/// 新进程第一次被调度的落点。第一次全局调用还负责挂载文件系统
/// （挂载要睡眠，不能在 main 里做）。
extern "C" fn forkret() -> ! {
    static FIRST: AtomicBool = AtomicBool::new(true);

    let (_, p) = myproc().expect("forkret");
    // 调度器切过来时持着本槽位的锁
    p.shared.raw().release();

    if FIRST.swap(false, Ordering::SeqCst) {
        let fs = fat32_fs::FatFs::mount(disk::block_device());
        file::set_fs(fs);
        let root = file::fs().root();
        unsafe { p.owned() }.res.as_mut().unwrap().cwd = Some(root);
    }

    trap::usertrapret()
}

/// ^P：打印进程表。
pub fn procdump() {
    println!("\nPID\tSTATE\tNAME\tMEM");
    PROC.for_each_used(|pid, state, name, sz| {
        let s = match state {
            ProcState::Unused => "unused",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        };
        println!("{}\t{}\t{}\t{}", pid, s, name, sz);
    });
}

/// 挂起接口的内核实现，睡眠锁经由它使用调度器。
pub struct ProcSuspend;

pub static PROC_SUSPEND: ProcSuspend = ProcSuspend;

impl sync::Suspend for ProcSuspend {
    fn current_pid(&self) -> isize {
        match myproc() {
            Some((_, p)) => unsafe { &*p.shared.data_ptr() }.pid,
            None => 0,
        }
    }

    fn sleep(&self, chan: usize, lk: &RawSpinLock) {
        sleep(chan, lk);
    }

    fn wakeup(&self, chan: usize) {
        PROC.wakeup(chan);
    }
}
