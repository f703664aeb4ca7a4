//! sync crate 功能性验证测试
//!
//! 这些测试验证 sync crate 对外提供的 API 的正确性。
//! 测试在用户态环境运行，使用 std；非 RISC-V 目标上中断开关为空操作，
//! 睡眠锁退化为自旋等待，外部行为不变。
//!
//! 关中断嵌套计数按核维护，宿主机上所有线程共享 0 号核，
//! 因此各测试用例通过 TEST_LOCK 串行执行。

use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::thread;
use sync::{RawSpinLock, SleepLock, SpinLock};

static TEST_LOCK: OnceLock<StdMutex<()>> = OnceLock::new();

fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK
        .get_or_init(|| StdMutex::new(()))
        .lock()
        .unwrap_or_else(|err| err.into_inner())
}

#[test]
fn test_push_pop_nesting() {
    let _guard = test_lock();
    // 嵌套计数应当成对回落
    let base = sync::hart_noff();
    sync::push_off();
    sync::push_off();
    assert_eq!(sync::hart_noff(), base + 2);
    sync::pop_off();
    assert_eq!(sync::hart_noff(), base + 1);
    sync::pop_off();
    assert_eq!(sync::hart_noff(), base);
}

#[test]
fn test_raw_spinlock_acquire_release() {
    let _guard = test_lock();
    let lk = RawSpinLock::new();
    assert!(!lk.holding());
    lk.acquire();
    assert!(lk.holding());
    lk.release();
    assert!(!lk.holding());
    // 释放后可以再次获取
    lk.acquire();
    lk.release();
}

#[test]
fn test_spinlock_guard_deref() {
    let _guard = test_lock();
    let lk = SpinLock::new(41u64);
    {
        let mut g = lk.lock();
        *g += 1;
    }
    assert_eq!(*lk.lock(), 42);
}

#[test]
fn test_spinlock_holds_noff() {
    let _guard = test_lock();
    // 持锁期间关中断嵌套增加一层
    let lk = SpinLock::new(());
    let base = sync::hart_noff();
    let g = lk.lock();
    assert_eq!(sync::hart_noff(), base + 1);
    drop(g);
    assert_eq!(sync::hart_noff(), base);
}

#[test]
fn test_spinlock_mutual_exclusion() {
    let _guard = test_lock();
    // 多线程计数不丢失更新
    let counter = Arc::new(SpinLock::new(0u64));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        handles.push(thread::spawn(move || {
            for _ in 0..10_000 {
                *counter.lock() += 1;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*counter.lock(), 40_000);
}

#[test]
fn test_sleeplock_guard_deref() {
    let _guard = test_lock();
    let lk = SleepLock::new([0u8; 4]);
    {
        let mut g = lk.lock();
        g[0] = 7;
    }
    assert_eq!(lk.lock()[0], 7);
}

#[test]
fn test_sleeplock_holding() {
    let _guard = test_lock();
    let lk = SleepLock::new(());
    assert!(!lk.holding());
    let g = lk.lock();
    assert!(lk.holding());
    drop(g);
    assert!(!lk.holding());
}

#[test]
fn test_sleeplock_mutual_exclusion() {
    let _guard = test_lock();
    let counter = Arc::new(SleepLock::new(0u64));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        handles.push(thread::spawn(move || {
            for _ in 0..5_000 {
                *counter.lock() += 1;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*counter.lock(), 20_000);
}

#[test]
fn test_spinlock_release_reacquire_contended() {
    let _guard = test_lock();
    // acquire(L); release(L); acquire(L) 在另一线程竞争下仍能成功
    let lk = Arc::new(SpinLock::new(0u32));
    let other = Arc::clone(&lk);
    let t = thread::spawn(move || {
        for _ in 0..1000 {
            *other.lock() += 1;
        }
    });
    for _ in 0..1000 {
        let g = lk.lock();
        drop(g);
        let mut g = lk.lock();
        *g += 1;
        drop(g);
    }
    t.join().unwrap();
    assert_eq!(*lk.lock(), 2000);
}
