//! 时钟：tickslock 保护的单调计数。每次时钟中断加一、
//! 广播唤醒睡在计数地址上的进程、预约下一次超时。

use sync::SpinLock;

use crate::proc;

/// 两次时钟中断间隔的机器周期数。
pub const INTERVAL: u64 = 1_000_000;

static TICKS: SpinLock<u64> = SpinLock::new(0);

pub fn set_next_timeout() {
    let _ = sbi_rt::set_timer(riscv::register::time::read64() + INTERVAL);
}

pub fn timer_tick() {
    let mut ticks = TICKS.lock();
    *ticks += 1;
    proc::wakeup(ticks_chan());
    drop(ticks);
    set_next_timeout();
}

pub fn ticks() -> u64 {
    *TICKS.lock()
}

/// sys_sleep 睡在这个通道上。
pub fn ticks_chan() -> usize {
    &TICKS as *const _ as usize
}

/// 持锁睡到 ticks 走过 n 个节拍；被 kill 返回 -1。
pub fn sleep_ticks(n: u64) -> isize {
    let mut ticks = TICKS.lock();
    let t0 = *ticks;
    while *ticks - t0 < n {
        if proc::current_killed() {
            return -1;
        }
        proc::sleep(ticks_chan(), unsafe { ticks.raw() });
    }
    0
}
