//! 陷入路径。
//!
//! 跳板页映射在每个用户页表的顶端：uservec 把用户寄存器存进
//! TRAPFRAME、换上进程内核页表后跳 usertrap；userret 反向恢复。
//! 内核态陷入走 kernelvec，在当前内核栈上保存调用者现场。

use core::arch::global_asm;
use kernel_console::println;
use kernel_vm::{PAGE_SIZE, TRAMPOLINE, TRAPFRAME, VKSTACK};
use proc_manage::ProcState;
use riscv::register::scause::{self, Exception, Interrupt, Trap};
use riscv::register::{sepc, stval};

use crate::kvm;
use crate::proc;
use crate::{console, disk, plic, syscall, timer, UART0_IRQ, VIRTIO0_IRQ};

global_asm!(
    r#"
    .section .text.trampoline
    .globl uservec
    .globl userret
    .align 4
uservec:
    # sscratch 里是 TRAPFRAME，换出 a0 腾一个工作寄存器
    csrrw a0, sscratch, a0

    sd ra, 40(a0)
    sd sp, 48(a0)
    sd gp, 56(a0)
    sd tp, 64(a0)
    sd t0, 72(a0)
    sd t1, 80(a0)
    sd t2, 88(a0)
    sd s0, 96(a0)
    sd s1, 104(a0)
    sd a1, 120(a0)
    sd a2, 128(a0)
    sd a3, 136(a0)
    sd a4, 144(a0)
    sd a5, 152(a0)
    sd a6, 160(a0)
    sd a7, 168(a0)
    sd s2, 176(a0)
    sd s3, 184(a0)
    sd s4, 192(a0)
    sd s5, 200(a0)
    sd s6, 208(a0)
    sd s7, 216(a0)
    sd s8, 224(a0)
    sd s9, 232(a0)
    sd s10, 240(a0)
    sd s11, 248(a0)
    sd t3, 256(a0)
    sd t4, 264(a0)
    sd t5, 272(a0)
    sd t6, 280(a0)

    # 用户 a0 暂存在 sscratch 里
    csrr t0, sscratch
    sd t0, 112(a0)

    # 进程内核栈、hartid、usertrap 入口、进程内核页表
    ld sp, 8(a0)
    ld tp, 32(a0)
    ld t0, 16(a0)
    ld t1, 0(a0)
    csrw satp, t1
    sfence.vma zero, zero

    jr t0

    .align 4
userret:
    # userret(TRAPFRAME, satp)：回到用户页表
    csrw satp, a1
    sfence.vma zero, zero

    # 用户 a0 先放回 sscratch
    ld t0, 112(a0)
    csrw sscratch, t0

    ld ra, 40(a0)
    ld sp, 48(a0)
    ld gp, 56(a0)
    ld tp, 64(a0)
    ld t0, 72(a0)
    ld t1, 80(a0)
    ld t2, 88(a0)
    ld s0, 96(a0)
    ld s1, 104(a0)
    ld a1, 120(a0)
    ld a2, 128(a0)
    ld a3, 136(a0)
    ld a4, 144(a0)
    ld a5, 152(a0)
    ld a6, 160(a0)
    ld a7, 168(a0)
    ld s2, 176(a0)
    ld s3, 184(a0)
    ld s4, 192(a0)
    ld s5, 200(a0)
    ld s6, 208(a0)
    ld s7, 216(a0)
    ld s8, 224(a0)
    ld s9, 232(a0)
    ld s10, 240(a0)
    ld s11, 248(a0)
    ld t3, 256(a0)
    ld t4, 264(a0)
    ld t5, 272(a0)
    ld t6, 280(a0)

    # a0 与 sscratch 互换：a0 恢复为用户值，sscratch 回到 TRAPFRAME
    csrrw a0, sscratch, a0
    sret
"#
);

global_asm!(
    r#"
    .section .text
    .globl kernelvec
    .align 4
kernelvec:
    addi sp, sp, -256
    sd ra, 0(sp)
    sd sp, 8(sp)
    sd gp, 16(sp)
    sd tp, 24(sp)
    sd t0, 32(sp)
    sd t1, 40(sp)
    sd t2, 48(sp)
    sd s0, 56(sp)
    sd s1, 64(sp)
    sd a0, 72(sp)
    sd a1, 80(sp)
    sd a2, 88(sp)
    sd a3, 96(sp)
    sd a4, 104(sp)
    sd a5, 112(sp)
    sd a6, 120(sp)
    sd a7, 128(sp)
    sd s2, 136(sp)
    sd s3, 144(sp)
    sd s4, 152(sp)
    sd s5, 160(sp)
    sd s6, 168(sp)
    sd s7, 176(sp)
    sd s8, 184(sp)
    sd s9, 192(sp)
    sd s10, 200(sp)
    sd s11, 208(sp)
    sd t3, 216(sp)
    sd t4, 224(sp)
    sd t5, 232(sp)
    sd t6, 240(sp)

    call kerneltrap

    ld ra, 0(sp)
    ld gp, 16(sp)
    # tp 不恢复：进程可能换了核
    ld t0, 32(sp)
    ld t1, 40(sp)
    ld t2, 48(sp)
    ld s0, 56(sp)
    ld s1, 64(sp)
    ld a0, 72(sp)
    ld a1, 80(sp)
    ld a2, 88(sp)
    ld a3, 96(sp)
    ld a4, 104(sp)
    ld a5, 112(sp)
    ld a6, 120(sp)
    ld a7, 128(sp)
    ld s2, 136(sp)
    ld s3, 144(sp)
    ld s4, 152(sp)
    ld s5, 160(sp)
    ld s6, 168(sp)
    ld s7, 176(sp)
    ld s8, 184(sp)
    ld s9, 192(sp)
    ld s10, 200(sp)
    ld s11, 208(sp)
    ld t3, 216(sp)
    ld t4, 224(sp)
    ld t5, 232(sp)
    ld t6, 240(sp)
    addi sp, sp, 256
    sret
"#
);

extern "C" {
    fn trampoline();
    fn uservec();
    fn userret();
    fn kernelvec();
}

const SSTATUS_SPP: usize = 1 << 8;
const SSTATUS_SPIE: usize = 1 << 5;

fn r_sstatus() -> usize {
    let x: usize;
    unsafe { core::arch::asm!("csrr {}, sstatus", out(reg) x) };
    x
}

fn w_sstatus(x: usize) {
    unsafe { core::arch::asm!("csrw sstatus, {}", in(reg) x) };
}

fn w_stvec(x: usize) {
    unsafe { core::arch::asm!("csrw stvec, {}", in(reg) x) };
}

/// 本核陷入初始化：内核向量、S 态中断使能、首个时钟。
pub fn init_hart() {
    w_stvec(kernelvec as usize);
    unsafe {
        riscv::register::sie::set_sext();
        riscv::register::sie::set_ssoft();
        riscv::register::sie::set_stimer();
        riscv::register::sstatus::set_sie();
    }
    timer::set_next_timeout();
}

/// 用户态陷入。系统调用打开中断后分发；设备与时钟中断就地处理，
/// 时钟额外让出处理器；其余原因标记 killed。
#[no_mangle]
pub extern "C" fn usertrap() -> ! {
    assert!((r_sstatus() & SSTATUS_SPP) == 0, "usertrap: not from user mode");

    // 现在在内核里，陷入走内核向量
    w_stvec(kernelvec as usize);

    let tf = proc::current_trapframe();
    unsafe { (*tf).epc = sepc::read() };

    let mut which_dev = 0;
    let cause = scause::read().cause();
    if cause == Trap::Exception(Exception::UserEnvCall) {
        if proc::current_killed() {
            proc::exit(-1);
        }
        unsafe { (*tf).epc += 4 };
        sync::enable_intr();
        syscall::syscall();
    } else {
        which_dev = devintr();
        if which_dev == 0 {
            let (_, p) = proc::myproc().expect("usertrap");
            let (pid, name) = {
                let sh = unsafe { &*p.shared.data_ptr() };
                (sh.pid, unsafe { p.owned() }.name_str())
            };
            println!(
                "\nusertrap(): unexpected scause {:?} pid={} {}",
                cause, pid, name
            );
            println!("            sepc={:#x} stval={:#x}", sepc::read(), stval::read());
            proc::set_current_killed();
        }
    }

    if proc::current_killed() {
        proc::exit(-1);
    }

    if which_dev == 2 {
        proc::yield_now();
    }

    usertrapret()
}

/// 回用户态：填 trapframe 的内核侧字段，经跳板页恢复用户现场。
pub fn usertrapret() -> ! {
    let (_, p) = proc::myproc().expect("usertrapret");
    sync::disable_intr();

    let tramp_uservec = TRAMPOLINE + (uservec as usize - trampoline as usize);
    w_stvec(tramp_uservec);

    let tf = proc::current_trapframe();
    unsafe {
        (*tf).kernel_satp = riscv::register::satp::read().bits();
        (*tf).kernel_sp = VKSTACK + PAGE_SIZE;
        (*tf).kernel_trap = usertrap as usize;
        (*tf).kernel_hartid = sync::hart_id();
    }

    // 回用户模式并在 sret 后开中断
    let mut x = r_sstatus();
    x &= !SSTATUS_SPP;
    x |= SSTATUS_SPIE;
    w_sstatus(x);

    unsafe { sepc::write((*tf).epc) };

    let upt = {
        let owned = unsafe { p.owned() };
        owned.res.as_ref().unwrap().upt
    };
    let usatp = kvm::make_satp(&upt);

    let tramp_userret = TRAMPOLINE + (userret as usize - trampoline as usize);
    let enter: extern "C" fn(usize, usize) -> ! =
        unsafe { core::mem::transmute(tramp_userret) };
    enter(TRAPFRAME, usatp)
}

/// 内核态陷入：只应当是设备或时钟中断。
#[no_mangle]
pub extern "C" fn kerneltrap() {
    let saved_sepc = sepc::read();
    let saved_sstatus = r_sstatus();

    assert!(
        (saved_sstatus & SSTATUS_SPP) != 0,
        "kerneltrap: not from supervisor mode"
    );
    assert!(!sync::intr_enabled(), "kerneltrap: interrupts enabled");

    let which_dev = devintr();
    if which_dev == 0 {
        println!("\nscause {:?}", scause::read().cause());
        println!(
            "sepc={:#x} stval={:#x} hart={}",
            saved_sepc,
            stval::read(),
            sync::hart_id()
        );
        if let Some((_, p)) = proc::myproc() {
            let sh = unsafe { &*p.shared.data_ptr() };
            println!("pid: {}, name: {}", sh.pid, unsafe { p.owned() }.name_str());
        }
        panic!("kerneltrap");
    }

    if which_dev == 2 {
        if let Some((_, p)) = proc::myproc() {
            if unsafe { &*p.shared.data_ptr() }.state == ProcState::Running {
                proc::yield_now();
            }
        }
    }

    // yield 期间别的陷入可能改写了这两个寄存器
    unsafe { sepc::write(saved_sepc) };
    w_sstatus(saved_sstatus);
}

/// 识别并处理设备中断。返回 2 表示时钟中断（调用方应让出），
/// 1 表示其他设备中断，0 表示不认识。
pub fn devintr() -> i32 {
    match scause::read().cause() {
        Trap::Interrupt(Interrupt::SupervisorExternal) => {
            let irq = plic::claim();
            if irq == UART0_IRQ {
                // SBI 控制台：把挤压的输入全部喂给行缓冲
                #[allow(deprecated)]
                loop {
                    let c = sbi_rt::legacy::console_getchar();
                    if c == usize::MAX {
                        break;
                    }
                    console::console_intr(c as u8);
                }
            } else if irq == VIRTIO0_IRQ {
                disk::disk_intr();
            } else if irq != 0 {
                log::warn!("unexpected interrupt irq = {}", irq);
            }
            if irq != 0 {
                plic::complete(irq);
            }
            1
        }
        Trap::Interrupt(Interrupt::SupervisorTimer) => {
            timer::timer_tick();
            2
        }
        _ => 0,
    }
}
