//! sync: 自旋锁与睡眠锁
//!
//! 自旋锁在持有期间关闭本核中断，并按核维护嵌套深度；
//! 睡眠锁在竞争时通过挂起接口让出处理器，由调度器在释放时唤醒。

#![no_std]

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use spin::Once;

#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
mod arch {
    pub fn intr_enabled() -> bool {
        riscv::register::sstatus::read().sie()
    }

    pub fn disable_intr() {
        unsafe {
            riscv::register::sstatus::clear_sie();
        }
    }

    pub fn enable_intr() {
        unsafe {
            riscv::register::sstatus::set_sie();
        }
    }

    /// 启动时每个核把自己的 hartid 写入 tp，此后保持不变。
    pub fn hart_id() -> usize {
        let id: usize;
        unsafe { core::arch::asm!("mv {}, tp", out(reg) id) };
        id
    }
}

#[cfg(not(any(target_arch = "riscv32", target_arch = "riscv64")))]
mod arch {
    pub fn intr_enabled() -> bool {
        false
    }

    pub fn disable_intr() {}

    pub fn enable_intr() {}

    pub fn hart_id() -> usize {
        0
    }
}

pub use arch::{disable_intr, enable_intr, hart_id, intr_enabled};

const MAX_HARTS: usize = 8;
const NO_OWNER: usize = usize::MAX;

/// 每个核的关中断嵌套状态。只被本核访问，宽松序即可。
struct HartIntr {
    noff: AtomicUsize,
    intena: AtomicBool,
}

const HART_INTR_INIT: HartIntr = HartIntr {
    noff: AtomicUsize::new(0),
    intena: AtomicBool::new(false),
};

static HARTS: [HartIntr; MAX_HARTS] = [HART_INTR_INIT; MAX_HARTS];

/// 关闭本核中断；最外层调用记录进入前的中断状态。
pub fn push_off() {
    let old = arch::intr_enabled();
    arch::disable_intr();
    let hart = &HARTS[arch::hart_id()];
    if hart.noff.load(Ordering::Relaxed) == 0 {
        hart.intena.store(old, Ordering::Relaxed);
    }
    hart.noff.fetch_add(1, Ordering::Relaxed);
}

/// 退出一层关中断区；嵌套归零且进入前中断打开时恢复中断。
pub fn pop_off() {
    assert!(!arch::intr_enabled(), "pop_off: interruptible");
    let hart = &HARTS[arch::hart_id()];
    let depth = hart.noff.fetch_sub(1, Ordering::Relaxed);
    assert!(depth >= 1, "pop_off");
    if depth == 1 && hart.intena.load(Ordering::Relaxed) {
        arch::enable_intr();
    }
}

/// 本核当前的关中断嵌套深度。
pub fn hart_noff() -> usize {
    HARTS[arch::hart_id()].noff.load(Ordering::Relaxed)
}

/// 最外层 push_off 保存的中断状态。调度器在上下文切换前后保存/恢复。
pub fn hart_intena() -> bool {
    HARTS[arch::hart_id()].intena.load(Ordering::Relaxed)
}

pub fn set_hart_intena(value: bool) {
    HARTS[arch::hart_id()].intena.store(value, Ordering::Relaxed);
}

// =============================================================================
// 自旋锁
// =============================================================================

/// 不携带数据的自旋锁本体。睡眠协议需要按地址辨识并原子换锁，
/// 因此单独暴露（见 [`Suspend::sleep`]）。
pub struct RawSpinLock {
    locked: AtomicBool,
    cpu: AtomicUsize,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_OWNER),
        }
    }

    /// 关中断并自旋获取。同核重复获取在 RISC-V 上 panic；
    /// 宿主机测试没有核标识，退化为继续自旋。
    pub fn acquire(&self) {
        push_off();
        #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
        assert!(!self.holding(), "acquire");
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpu.store(arch::hart_id(), Ordering::Relaxed);
    }

    pub fn release(&self) {
        assert!(self.holding(), "release");
        self.cpu.store(NO_OWNER, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// 本核是否持有该锁。
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == arch::hart_id()
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// 携带数据的自旋锁，守卫释放。持锁期间本核中断关闭，
/// 持有者不得跨睡眠持锁。
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.raw.acquire();
        SpinGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        self.raw.holding()
    }

    /// 锁本体，用于睡眠协议中的原子换锁。
    pub fn raw(&self) -> &RawSpinLock {
        &self.raw
    }

    /// 数据指针，配合 [`Self::raw`] 的手动加锁使用；
    /// 调度切换会把锁的释放交给另一个执行流，守卫表达不了。
    ///
    /// # Safety 约定
    /// 解引用期间必须持有锁（极少数诊断路径除外，如 procdump）。
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinGuard<'a, T> {
    /// 守卫对应的锁本体。
    ///
    /// # Safety
    /// 调用者若释放了返回的锁，必须在守卫失效（drop 或继续解引用）前重新获取。
    pub unsafe fn raw(&self) -> &RawSpinLock {
        &self.lock.raw
    }
}

impl<'a, T> Deref for SpinGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

// =============================================================================
// 挂起接口
// =============================================================================

/// 调度器提供的挂起能力。`sleep` 释放 `lk` 并把当前进程挂到 `chan` 上，
/// 返回前重新获取 `lk`；释放与挂起相对唤醒者原子。
pub trait Suspend: Sync {
    fn current_pid(&self) -> isize;
    fn sleep(&self, chan: usize, lk: &RawSpinLock);
    fn wakeup(&self, chan: usize);
}

static SUSPEND: Once<&'static dyn Suspend> = Once::new();

/// 注册挂起实现，内核启动时调用一次。
pub fn init_suspend(ops: &'static dyn Suspend) {
    SUSPEND.call_once(|| ops);
}

pub fn current_pid() -> isize {
    match SUSPEND.get() {
        Some(ops) => ops.current_pid(),
        None => 0,
    }
}

fn suspend_sleep(chan: usize, lk: &RawSpinLock) {
    match SUSPEND.get() {
        Some(ops) => ops.sleep(chan, lk),
        // 未注册调度器（宿主机测试）：放锁自旋等价于伪唤醒，
        // 调用方本来就必须重新检查谓词。
        None => {
            lk.release();
            spin_loop();
            lk.acquire();
        }
    }
}

fn suspend_wakeup(chan: usize) {
    if let Some(ops) = SUSPEND.get() {
        ops.wakeup(chan);
    }
}

// =============================================================================
// 睡眠锁
// =============================================================================

struct SleepInner {
    locked: bool,
    pid: isize,
}

/// 阻塞互斥锁：竞争时睡在锁地址上。不可重入，
/// 不得在持有任何自旋锁时获取。
pub struct SleepLock<T> {
    lk: SpinLock<SleepInner>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lk: SpinLock::new(SleepInner {
                locked: false,
                pid: -1,
            }),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepGuard<'_, T> {
        let chan = self as *const _ as usize;
        let mut inner = self.lk.lock();
        while inner.locked {
            suspend_sleep(chan, unsafe { inner.raw() });
        }
        inner.locked = true;
        inner.pid = current_pid();
        drop(inner);
        SleepGuard { lock: self }
    }

    /// 当前进程是否持有该睡眠锁。
    pub fn holding(&self) -> bool {
        let inner = self.lk.lock();
        inner.locked && inner.pid == current_pid()
    }
}

pub struct SleepGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<'a, T> Deref for SleepGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SleepGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SleepGuard<'a, T> {
    fn drop(&mut self) {
        let chan = self.lock as *const _ as usize;
        let mut inner = self.lock.lk.lock();
        inner.locked = false;
        inner.pid = -1;
        suspend_wakeup(chan);
        drop(inner);
    }
}
