//! proc-manage: 进程表簿记
//!
//! 固定槽位的进程表：每槽一把自旋锁保护状态机字段，
//! 资源字段（页表、trapframe、打开文件）由内核以 `R` 注入，
//! 进程 RUNNING 之后归持有者私有。上下文切换、睡眠与调度循环
//! 在内核里组合这些原语。

#![no_std]

use core::cell::UnsafeCell;
use sync::{SpinGuard, SpinLock};

/// 进程状态机。
/// Unused →(分配)→ Runnable → Running ↔ Sleeping/Runnable → Zombie →(父进程回收)→ Unused
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// `swtch` 保存的被调用者保存寄存器。布局对汇编可见。
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

impl Context {
    pub const ZERO: Context = Context {
        ra: 0,
        sp: 0,
        s: [0; 12],
    };
}

/// 用户陷入帧。字段顺序对跳板汇编可见，不得调整。
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize,
    /*   8 */ pub kernel_sp: usize,
    /*  16 */ pub kernel_trap: usize,
    /*  24 */ pub epc: usize,
    /*  32 */ pub kernel_hartid: usize,
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

/// 槽位自旋锁保护的字段。
pub struct ProcShared {
    pub state: ProcState,
    /// 睡眠通道；0 表示未睡眠。
    pub chan: usize,
    pub killed: bool,
    pub xstate: i32,
    pub pid: isize,
    /// 父进程槽位下标。
    pub parent: Option<usize>,
}

impl ProcShared {
    pub const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            chan: 0,
            killed: false,
            xstate: 0,
            pid: 0,
            parent: None,
        }
    }

    /// 回到 Unused 并清空状态机字段。资源字段由内核先行释放。
    pub fn clear(&mut self) {
        self.state = ProcState::Unused;
        self.chan = 0;
        self.killed = false;
        self.xstate = 0;
        self.pid = 0;
        self.parent = None;
    }

    /// exit 路径的定向唤醒：父进程睡在自己槽位地址上。
    pub fn wake_if_waiting_on(&mut self, chan: usize) {
        if self.state == ProcState::Sleeping && self.chan == chan {
            self.state = ProcState::Runnable;
        }
    }
}

/// RUNNING 后归持有进程私有的字段，免锁访问。
pub struct ProcOwned<R> {
    pub kstack: usize,
    pub sz: usize,
    pub context: Context,
    pub name: [u8; 16],
    pub tmask: u32,
    /// 内核注入的资源束（页表、trapframe 页、打开文件、cwd）。
    pub res: Option<R>,
}

impl<R> ProcOwned<R> {
    pub const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            context: Context::ZERO,
            name: [0; 16],
            tmask: 0,
            res: None,
        }
    }

    pub fn clear(&mut self) {
        self.kstack = 0;
        self.sz = 0;
        self.context = Context::ZERO;
        self.name = [0; 16];
        self.tmask = 0;
        self.res = None;
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.name = [0; 16];
        let n = name.len().min(15);
        self.name[..n].copy_from_slice(&name[..n]);
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(16);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }
}

/// 一个进程槽位。
pub struct Proc<R> {
    pub shared: SpinLock<ProcShared>,
    owned: UnsafeCell<ProcOwned<R>>,
}

unsafe impl<R: Send> Sync for Proc<R> {}

impl<R> Proc<R> {
    pub fn new() -> Self {
        Self {
            shared: SpinLock::new(ProcShared::new()),
            owned: UnsafeCell::new(ProcOwned::new()),
        }
    }

    /// 私有字段。
    ///
    /// # Safety
    /// 仅持有者进程在 RUNNING 期间访问，或分配/回收路径在持有
    /// 槽位锁、确认无持有者时访问。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn owned(&self) -> &mut ProcOwned<R> {
        &mut *self.owned.get()
    }
}

impl<R> Default for Proc<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// 每个硬件线程的记录：正在运行的进程槽位和调度器上下文。
/// 只被本核在关中断下访问。
pub struct Cpu {
    pub proc_slot: Option<usize>,
    pub context: Context,
}

pub struct CpuTable<const NCPU: usize> {
    cpus: [UnsafeCell<Cpu>; NCPU],
}

unsafe impl<const NCPU: usize> Sync for CpuTable<NCPU> {}

impl<const NCPU: usize> CpuTable<NCPU> {
    pub fn new() -> Self {
        Self {
            cpus: core::array::from_fn(|_| {
                UnsafeCell::new(Cpu {
                    proc_slot: None,
                    context: Context::ZERO,
                })
            }),
        }
    }

    /// 本核的记录。
    ///
    /// # Safety
    /// 必须在关中断下调用，返回的引用不得跨越开中断点。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn current(&self) -> &mut Cpu {
        &mut *self.cpus[sync::hart_id()].get()
    }
}

impl<const NCPU: usize> Default for CpuTable<NCPU> {
    fn default() -> Self {
        Self::new()
    }
}

/// 固定容量的进程表与单调 PID 分配器。
pub struct ProcTable<R, const N: usize> {
    slots: [Proc<R>; N],
    next_pid: SpinLock<isize>,
}

impl<R, const N: usize> ProcTable<R, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Proc::new()),
            next_pid: SpinLock::new(1),
        }
    }

    pub fn slot(&self, idx: usize) -> &Proc<R> {
        &self.slots[idx]
    }

    pub fn slots(&self) -> &[Proc<R>; N] {
        &self.slots
    }

    /// 槽位地址作为睡眠通道。
    pub fn slot_chan(&self, idx: usize) -> usize {
        &self.slots[idx] as *const _ as usize
    }

    pub fn alloc_pid(&self) -> isize {
        let mut next = self.next_pid.lock();
        let pid = *next;
        *next += 1;
        pid
    }

    /// 逐个加锁寻找 Unused 槽位，找到则分配 PID 并返回仍持锁的守卫。
    /// 调用方在锁内完成资源初始化。
    pub fn alloc_slot(&self) -> Option<(usize, SpinGuard<'_, ProcShared>)> {
        for (idx, proc) in self.slots.iter().enumerate() {
            let mut guard = proc.shared.lock();
            if guard.state == ProcState::Unused {
                guard.pid = self.alloc_pid();
                return Some((idx, guard));
            }
            drop(guard);
        }
        None
    }

    /// 唤醒睡在 chan 上的所有进程。伪唤醒是允许的，
    /// 睡眠方必须重查谓词。
    pub fn wakeup(&self, chan: usize) {
        for proc in self.slots.iter() {
            let mut guard = proc.shared.lock();
            if guard.state == ProcState::Sleeping && guard.chan == chan {
                guard.state = ProcState::Runnable;
            }
        }
    }

    /// 标记 pid 为 killed；睡眠中的进程转为可运行以便观察标记。
    pub fn kill(&self, pid: isize) -> bool {
        for proc in self.slots.iter() {
            let mut guard = proc.shared.lock();
            if guard.pid == pid && guard.state != ProcState::Unused {
                guard.killed = true;
                if guard.state == ProcState::Sleeping {
                    guard.state = ProcState::Runnable;
                }
                return true;
            }
        }
        false
    }

    /// 把 from 槽位的全部子进程过继给 init。
    /// 先无锁筛选再加锁改写：exit 调用时已持有父槽位与自身的锁，
    /// 对非子槽位加锁会与之成环。
    pub fn reparent(&self, from: usize, init: usize) {
        for (idx, proc) in self.slots.iter().enumerate() {
            if idx == from {
                continue;
            }
            let is_child = unsafe { &*proc.shared.data_ptr() }.parent == Some(from);
            if is_child {
                let mut guard = proc.shared.lock();
                if guard.parent == Some(from) {
                    guard.parent = Some(init);
                }
            }
        }
    }

    /// 非 Unused 槽位数。
    pub fn count_used(&self) -> usize {
        self.slots
            .iter()
            .filter(|p| p.shared.lock().state != ProcState::Unused)
            .count()
    }

    /// 遍历非 Unused 槽位（procdump 用）。名字来自私有区，
    /// 不加锁读取，卡死的机器也能打印。
    pub fn for_each_used(&self, mut f: impl FnMut(isize, ProcState, &str, usize)) {
        for proc in self.slots.iter() {
            let (pid, state) = {
                let guard = proc.shared.lock();
                (guard.pid, guard.state)
            };
            if state == ProcState::Unused {
                continue;
            }
            let owned = unsafe { proc.owned() };
            f(pid, state, owned.name_str(), owned.sz);
        }
    }
}

impl<R, const N: usize> Default for ProcTable<R, N> {
    fn default() -> Self {
        Self::new()
    }
}
