//! proc-manage crate 功能性验证测试
//!
//! 在用户态验证进程表的状态机与簿记；上下文切换与调度循环
//! 需要目标机支持，在内核集成层验证。

use core::mem::{offset_of, size_of};
use proc_manage::{Context, Proc, ProcState, ProcTable, TrapFrame};

type Table = ProcTable<(), 8>;

#[test]
fn test_trapframe_layout() {
    // 布局对跳板汇编可见，偏移是接线规格
    assert_eq!(size_of::<TrapFrame>(), 288);
    assert_eq!(offset_of!(TrapFrame, kernel_satp), 0);
    assert_eq!(offset_of!(TrapFrame, kernel_sp), 8);
    assert_eq!(offset_of!(TrapFrame, kernel_trap), 16);
    assert_eq!(offset_of!(TrapFrame, epc), 24);
    assert_eq!(offset_of!(TrapFrame, kernel_hartid), 32);
    assert_eq!(offset_of!(TrapFrame, ra), 40);
    assert_eq!(offset_of!(TrapFrame, sp), 48);
    assert_eq!(offset_of!(TrapFrame, a0), 112);
    assert_eq!(offset_of!(TrapFrame, a7), 168);
    assert_eq!(offset_of!(TrapFrame, s2), 176);
    assert_eq!(offset_of!(TrapFrame, s11), 248);
    assert_eq!(offset_of!(TrapFrame, t3), 256);
    assert_eq!(offset_of!(TrapFrame, t6), 280);
}

#[test]
fn test_context_layout() {
    assert_eq!(size_of::<Context>(), 14 * 8);
    assert_eq!(offset_of!(Context, ra), 0);
    assert_eq!(offset_of!(Context, sp), 8);
    assert_eq!(offset_of!(Context, s), 16);
}

#[test]
fn test_pid_monotone() {
    let t = Table::new();
    let a = t.alloc_pid();
    let b = t.alloc_pid();
    let c = t.alloc_pid();
    assert!(a < b && b < c);
}

#[test]
fn test_alloc_slot_claims_unused() {
    let t = Table::new();
    let (idx, mut g) = t.alloc_slot().unwrap();
    assert_eq!(g.state, ProcState::Unused);
    assert!(g.pid >= 1);
    g.state = ProcState::Runnable;
    drop(g);

    // 第二次分配给出另一个槽位和更大的 PID
    let (idx2, g2) = t.alloc_slot().unwrap();
    assert_ne!(idx, idx2);
    let first_pid = t.slot(idx).shared.lock().pid;
    assert!(g2.pid > first_pid);
}

#[test]
fn test_alloc_slot_exhaustion() {
    let t = Table::new();
    let mut guards = Vec::new();
    for _ in 0..8 {
        let (idx, mut g) = t.alloc_slot().unwrap();
        g.state = ProcState::Runnable;
        drop(g);
        guards.push(idx);
    }
    assert!(t.alloc_slot().is_none());

    // 释放一个槽位后又能分配
    t.slot(guards[3]).shared.lock().clear();
    let (idx, _g) = t.alloc_slot().unwrap();
    assert_eq!(idx, guards[3]);
}

#[test]
fn test_wakeup_matches_channel() {
    let t = Table::new();
    let (a, mut g) = t.alloc_slot().unwrap();
    g.state = ProcState::Sleeping;
    g.chan = 0x1000;
    drop(g);
    let (b, mut g) = t.alloc_slot().unwrap();
    g.state = ProcState::Sleeping;
    g.chan = 0x2000;
    drop(g);

    t.wakeup(0x1000);
    assert_eq!(t.slot(a).shared.lock().state, ProcState::Runnable);
    assert_eq!(t.slot(b).shared.lock().state, ProcState::Sleeping);
}

#[test]
fn test_kill_wakes_sleeper() {
    let t = Table::new();
    let (idx, mut g) = t.alloc_slot().unwrap();
    let pid = g.pid;
    g.state = ProcState::Sleeping;
    g.chan = 0xbeef;
    drop(g);

    assert!(t.kill(pid));
    let g = t.slot(idx).shared.lock();
    assert!(g.killed);
    assert_eq!(g.state, ProcState::Runnable);
    drop(g);

    // 不存在的 pid
    assert!(!t.kill(9999));
}

#[test]
fn test_kill_running_not_requeued() {
    let t = Table::new();
    let (idx, mut g) = t.alloc_slot().unwrap();
    let pid = g.pid;
    g.state = ProcState::Running;
    drop(g);
    assert!(t.kill(pid));
    let g = t.slot(idx).shared.lock();
    assert!(g.killed);
    assert_eq!(g.state, ProcState::Running);
}

#[test]
fn test_reparent() {
    let t = Table::new();
    let (init, mut g) = t.alloc_slot().unwrap();
    g.state = ProcState::Runnable;
    drop(g);
    let (parent, mut g) = t.alloc_slot().unwrap();
    g.state = ProcState::Runnable;
    drop(g);
    let (c1, mut g) = t.alloc_slot().unwrap();
    g.state = ProcState::Runnable;
    g.parent = Some(parent);
    drop(g);
    let (c2, mut g) = t.alloc_slot().unwrap();
    g.state = ProcState::Runnable;
    g.parent = Some(parent);
    drop(g);

    t.reparent(parent, init);
    assert_eq!(t.slot(c1).shared.lock().parent, Some(init));
    assert_eq!(t.slot(c2).shared.lock().parent, Some(init));
}

#[test]
fn test_wake_if_waiting_on() {
    let t = Table::new();
    let (idx, mut g) = t.alloc_slot().unwrap();
    let chan = t.slot_chan(idx);
    g.state = ProcState::Sleeping;
    g.chan = chan;
    g.wake_if_waiting_on(chan);
    assert_eq!(g.state, ProcState::Runnable);
    // 通道不匹配时不动
    g.state = ProcState::Sleeping;
    g.chan = chan;
    g.wake_if_waiting_on(chan + 8);
    assert_eq!(g.state, ProcState::Sleeping);
}

#[test]
fn test_count_and_dump() {
    let t = Table::new();
    assert_eq!(t.count_used(), 0);
    let (idx, mut g) = t.alloc_slot().unwrap();
    g.state = ProcState::Runnable;
    drop(g);
    unsafe { t.slot(idx).owned() }.set_name(b"initcode");
    assert_eq!(t.count_used(), 1);

    let mut seen = Vec::new();
    t.for_each_used(|pid, state, name, sz| seen.push((pid, state, name.to_string(), sz)));
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, ProcState::Runnable);
    assert_eq!(seen[0].2, "initcode");
}

#[test]
fn test_owned_clear() {
    let p: Proc<u32> = Proc::new();
    let owned = unsafe { p.owned() };
    owned.kstack = 0x1000;
    owned.sz = 4096;
    owned.res = Some(7);
    owned.set_name(b"proc");
    owned.clear();
    assert_eq!(owned.kstack, 0);
    assert_eq!(owned.sz, 0);
    assert!(owned.res.is_none());
    assert_eq!(owned.name_str(), "");
}
