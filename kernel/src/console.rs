//! 控制台：SBI 逐字节输出，行缓冲输入。
//! ^U 删行、^H/DEL 删字符、^P 打印进程表、^D 或换行提交一行。

use kernel_console::Console;
use sync::SpinLock;

use crate::proc;

/// 全局打印走 SBI legacy putchar。
pub struct SbiConsole;

impl Console for SbiConsole {
    fn put_char(&self, c: u8) {
        #[allow(deprecated)]
        sbi_rt::legacy::console_putchar(c as usize);
    }
}

const CTRL_D: u8 = 0x04;
const CTRL_H: u8 = 0x08;
const CTRL_P: u8 = 0x10;
const CTRL_U: u8 = 0x15;
const DEL: u8 = 0x7f;

const INPUT_BUF: usize = 128;

struct Cons {
    buf: [u8; INPUT_BUF],
    /// 读、写、编辑游标（只增，取模用）。
    r: usize,
    w: usize,
    e: usize,
}

static CONS: SpinLock<Cons> = SpinLock::new(Cons {
    buf: [0; INPUT_BUF],
    r: 0,
    w: 0,
    e: 0,
});

fn cons_chan() -> usize {
    &CONS as *const _ as usize
}

fn putc(c: u8) {
    #[allow(deprecated)]
    sbi_rt::legacy::console_putchar(c as usize);
}

fn backspace() {
    putc(CTRL_H);
    putc(b' ');
    putc(CTRL_H);
}

/// 控制台写：逐字节无缓冲。
pub fn console_write(src: &[u8]) -> isize {
    for &c in src {
        putc(c);
    }
    src.len() as isize
}

/// 控制台读：睡到有完整的一行。遇 ^D 提前返回；
/// 进程被 kill 时醒来返回 -1。
pub fn console_read(dst: &mut [u8]) -> isize {
    let mut cons = CONS.lock();
    let mut n = 0usize;
    while n < dst.len() {
        while cons.r == cons.w {
            if proc::current_killed() {
                return -1;
            }
            proc::sleep(cons_chan(), unsafe { cons.raw() });
        }
        let c = cons.buf[cons.r % INPUT_BUF];
        cons.r += 1;

        if c == CTRL_D {
            if n > 0 {
                // 留着 ^D 给下一次读
                cons.r -= 1;
            }
            break;
        }
        dst[n] = c;
        n += 1;
        if c == b'\n' {
            break;
        }
    }
    n as isize
}

/// 串口中断里喂进来的一个字符。
pub fn console_intr(c: u8) {
    let mut cons = CONS.lock();
    match c {
        CTRL_P => {
            drop(cons);
            proc::procdump();
            return;
        }
        CTRL_U => {
            while cons.e != cons.w && cons.buf[(cons.e - 1) % INPUT_BUF] != b'\n' {
                cons.e -= 1;
                backspace();
            }
        }
        CTRL_H | DEL => {
            if cons.e != cons.w {
                cons.e -= 1;
                backspace();
            }
        }
        _ => {
            if cons.e - cons.r < INPUT_BUF {
                let c = if c == b'\r' { b'\n' } else { c };
                // 回显
                putc(c);
                let e = cons.e;
                cons.buf[e % INPUT_BUF] = c;
                cons.e += 1;
                if c == b'\n' || c == CTRL_D || cons.e - cons.r == INPUT_BUF {
                    cons.w = cons.e;
                    proc::wakeup(cons_chan());
                }
            }
        }
    }
}
