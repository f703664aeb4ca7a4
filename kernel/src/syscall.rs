//! 系统调用分发。
//!
//! 参数取自 trapframe 的 a0..a5，调用号在 a7，返回值写回 a0。
//! 进程的内核页表镜像了用户内存，指针参数经边界检查后
//! 直接按普通内存访问。

use alloc::sync::Arc;
use alloc::vec::Vec;
use fat32_fs::{Attr, Ent, EntryFile, FAT32_MAX_FILENAME};
use kernel_console::println;
use kernel_vm::{copy_in_str2, copy_out2};
use proc_manage::TrapFrame;
use sync::SleepGuard;

use crate::file::{self, File};
use crate::proc::{self, ProcRes};
use crate::{exec, timer, NOFILE};

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_FSTAT: usize = 8;
pub const SYS_CHDIR: usize = 9;
pub const SYS_DUP: usize = 10;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_OPEN: usize = 15;
pub const SYS_WRITE: usize = 16;
pub const SYS_DEV: usize = 17;
pub const SYS_REMOVE: usize = 18;
pub const SYS_TRACE: usize = 19;
pub const SYS_MKDIR: usize = 20;
pub const SYS_CLOSE: usize = 21;

const O_RDONLY: usize = 0x000;
const O_WRONLY: usize = 0x001;
const O_RDWR: usize = 0x002;
const O_CREATE: usize = 0x200;
const O_TRUNC: usize = 0x400;

const MAXARG: usize = 32;

fn syscall_name(num: usize) -> &'static str {
    match num {
        SYS_FORK => "fork",
        SYS_EXIT => "exit",
        SYS_WAIT => "wait",
        SYS_READ => "read",
        SYS_KILL => "kill",
        SYS_EXEC => "exec",
        SYS_FSTAT => "fstat",
        SYS_CHDIR => "chdir",
        SYS_DUP => "dup",
        SYS_GETPID => "getpid",
        SYS_SBRK => "sbrk",
        SYS_SLEEP => "sleep",
        SYS_UPTIME => "uptime",
        SYS_OPEN => "open",
        SYS_WRITE => "write",
        SYS_DEV => "dev",
        SYS_REMOVE => "remove",
        SYS_TRACE => "trace",
        SYS_MKDIR => "mkdir",
        SYS_CLOSE => "close",
        _ => "?",
    }
}

fn tf() -> &'static mut TrapFrame {
    unsafe { &mut *proc::current_trapframe() }
}

fn argraw(n: usize) -> usize {
    let tf = tf();
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw"),
    }
}

fn argint(n: usize) -> isize {
    argraw(n) as isize
}

fn argaddr(n: usize) -> usize {
    argraw(n)
}

/// 取用户空间的 NUL 结尾字符串。
fn argstr(n: usize, buf: &mut [u8]) -> Result<usize, ()> {
    let addr = argraw(n);
    unsafe { copy_in_str2(proc::current_sz(), buf, addr) }
}

/// 把用户缓冲区核验成内核可直接访问的切片。
/// 只在当前进程的内核页表已装载时成立。
fn user_slice_mut(addr: usize, len: usize) -> Option<&'static mut [u8]> {
    let sz = proc::current_sz();
    if addr >= sz || addr.checked_add(len)? > sz {
        return None;
    }
    Some(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

fn user_slice(addr: usize, len: usize) -> Option<&'static [u8]> {
    user_slice_mut(addr, len).map(|s| &*s)
}

fn argfd(n: usize) -> Option<Arc<File>> {
    let fd = argraw(n);
    if fd >= NOFILE {
        return None;
    }
    let res = current_res();
    res.ofile[fd].as_ref().cloned()
}

fn current_res() -> &'static mut ProcRes {
    let (_, p) = proc::myproc().expect("syscall");
    unsafe { p.owned() }.res.as_mut().expect("no resources")
}

fn fdalloc(f: Arc<File>) -> Option<usize> {
    let res = current_res();
    for (fd, slot) in res.ofile.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(f);
            return Some(fd);
        }
    }
    None
}

pub fn syscall() {
    let num = tf().a7;
    let ret = dispatch(num);
    let (_, p) = proc::myproc().expect("syscall");
    let (pid, tmask) = {
        let sh = unsafe { &*p.shared.data_ptr() };
        (sh.pid, unsafe { p.owned() }.tmask)
    };
    if (tmask & (1 << num.min(31)) as u32) != 0 {
        println!("pid {}: sys_{} -> {}", pid, syscall_name(num), ret);
    }
    tf().a0 = ret as usize;
}

fn dispatch(num: usize) -> isize {
    match num {
        SYS_FORK => proc::fork(),
        SYS_EXIT => proc::exit(argint(0) as i32),
        SYS_WAIT => proc::wait(argaddr(0)),
        SYS_READ => sys_read(),
        SYS_KILL => proc::kill(argint(0)),
        SYS_EXEC => sys_exec(),
        SYS_FSTAT => sys_fstat(),
        SYS_CHDIR => sys_chdir(),
        SYS_DUP => sys_dup(),
        SYS_GETPID => sys_getpid(),
        SYS_SBRK => sys_sbrk(),
        SYS_SLEEP => timer::sleep_ticks(argint(0).max(0) as u64),
        SYS_UPTIME => timer::ticks() as isize,
        SYS_OPEN => sys_open(),
        SYS_WRITE => sys_write(),
        SYS_DEV => sys_dev(),
        SYS_REMOVE => sys_remove(),
        SYS_TRACE => sys_trace(),
        SYS_MKDIR => sys_mkdir(),
        SYS_CLOSE => sys_close(),
        _ => {
            let (_, p) = proc::myproc().expect("syscall");
            let sh = unsafe { &*p.shared.data_ptr() };
            println!("pid {}: unknown sys call {}", sh.pid, num);
            -1
        }
    }
}

fn sys_getpid() -> isize {
    let (_, p) = proc::myproc().expect("getpid");
    unsafe { &*p.shared.data_ptr() }.pid
}

fn sys_sbrk() -> isize {
    let n = argint(0);
    let addr = proc::current_sz() as isize;
    if proc::growproc(n) < 0 {
        return -1;
    }
    addr
}

fn sys_trace() -> isize {
    let (_, p) = proc::myproc().expect("trace");
    unsafe { p.owned() }.tmask = argraw(0) as u32;
    0
}

fn sys_read() -> isize {
    let Some(f) = argfd(0) else { return -1 };
    let addr = argaddr(1);
    let n = argraw(2);
    let Some(dst) = user_slice_mut(addr, n) else {
        return -1;
    };
    file::fileread(&f, dst)
}

fn sys_write() -> isize {
    let Some(f) = argfd(0) else { return -1 };
    let addr = argaddr(1);
    let n = argraw(2);
    let Some(src) = user_slice(addr, n) else {
        return -1;
    };
    file::filewrite(&f, src)
}

fn sys_dup() -> isize {
    let Some(f) = argfd(0) else { return -1 };
    match fdalloc(f) {
        Some(fd) => fd as isize,
        None => -1,
    }
}

fn sys_close() -> isize {
    let fd = argraw(0);
    let res = current_res();
    if fd >= NOFILE || res.ofile[fd].is_none() {
        return -1;
    }
    res.ofile[fd] = None;
    0
}

fn sys_fstat() -> isize {
    let Some(f) = argfd(0) else { return -1 };
    let addr = argaddr(1);
    let Some(st) = file::filestat(&f) else {
        return -1;
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(
            (&st as *const fat32_fs::Stat).cast::<u8>(),
            core::mem::size_of::<fat32_fs::Stat>(),
        )
    };
    match unsafe { copy_out2(proc::current_sz(), addr, bytes) } {
        Ok(()) => 0,
        Err(()) => -1,
    }
}

/// 解析路径并创建末级项；已存在时返回现有项。
fn create(path: &[u8], attr: Attr) -> Option<Ent> {
    let fs = file::fs();
    let cwd = current_res().cwd.as_ref().map(|c| fs.edup(c));
    let mut name = [0u8; FAT32_MAX_FILENAME + 1];
    let dp = fs.ename_parent(cwd.as_ref(), path, &mut name)?;
    if let Some(c) = cwd {
        fs.eput(c);
    }
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    let ep = {
        let mut dpf = fs.elock(&dp);
        fs.ealloc(&dp, &mut dpf, &name[..end], attr)
    };
    fs.eput(dp);
    ep
}

fn lookup(path: &[u8]) -> Option<Ent> {
    let fs = file::fs();
    let cwd = current_res().cwd.as_ref().map(|c| fs.edup(c));
    let ep = fs.ename(cwd.as_ref(), path);
    if let Some(c) = cwd {
        fs.eput(c);
    }
    ep
}

fn sys_open() -> isize {
    let mut path = [0u8; FAT32_MAX_FILENAME + 1];
    if argstr(0, &mut path).is_err() {
        return -1;
    }
    let omode = argraw(1);
    let path = path_bytes(&path);
    let fs = file::fs();

    let ep = if (omode & O_CREATE) != 0 {
        create(path, Attr::empty())
    } else {
        lookup(path)
    };
    let Some(ep) = ep else { return -1 };

    {
        let mut ef: SleepGuard<'_, EntryFile> = fs.elock(&ep);
        if ef.is_dir() && omode != O_RDONLY {
            drop(ef);
            fs.eput(ep);
            return -1;
        }
        if (omode & O_TRUNC) != 0 && !ef.is_dir() {
            fs.etrunc(&mut ef);
        }
    }

    let readable = (omode & O_WRONLY) == 0;
    let writable = (omode & O_WRONLY) != 0 || (omode & O_RDWR) != 0;
    let f = File::new_entry(readable, writable, ep);
    match fdalloc(f) {
        Some(fd) => fd as isize,
        None => -1,
    }
}

fn sys_dev() -> isize {
    let omode = argraw(0);
    let major = argraw(1);
    let _minor = argraw(2);
    if major >= file::NDEV {
        return -1;
    }
    let readable = (omode & O_WRONLY) == 0;
    let writable = (omode & O_WRONLY) != 0 || (omode & O_RDWR) != 0;
    let f = File::new_device(readable, writable, major);
    match fdalloc(f) {
        Some(fd) => fd as isize,
        None => -1,
    }
}

fn sys_mkdir() -> isize {
    let mut path = [0u8; FAT32_MAX_FILENAME + 1];
    if argstr(0, &mut path).is_err() {
        return -1;
    }
    let fs = file::fs();
    match create(path_bytes(&path), Attr::DIRECTORY) {
        Some(ep) => {
            fs.eput(ep);
            0
        }
        None => -1,
    }
}

fn sys_chdir() -> isize {
    let mut path = [0u8; FAT32_MAX_FILENAME + 1];
    if argstr(0, &mut path).is_err() {
        return -1;
    }
    let fs = file::fs();
    let Some(ep) = lookup(path_bytes(&path)) else {
        return -1;
    };
    {
        let ef = fs.elock(&ep);
        if !ef.is_dir() {
            drop(ef);
            fs.eput(ep);
            return -1;
        }
    }
    let res = current_res();
    if let Some(old) = res.cwd.take() {
        fs.eput(old);
    }
    res.cwd = Some(ep);
    0
}

fn sys_remove() -> isize {
    let mut path = [0u8; FAT32_MAX_FILENAME + 1];
    if argstr(0, &mut path).is_err() {
        return -1;
    }
    let fs = file::fs();
    let Some(ep) = lookup(path_bytes(&path)) else {
        return -1;
    };
    if fs.is_root(&ep) {
        fs.eput(ep);
        return -1;
    }
    let parent = fs.parent_of(&ep);
    {
        let mut ef = fs.elock(&ep);
        // 非空目录不能删
        if ef.is_dir() && !fs.dir_is_empty(&mut ef) {
            drop(ef);
            fs.eput(parent);
            fs.eput(ep);
            return -1;
        }
        let mut pf = fs.elock(&parent);
        fs.eremove(&ep, &mut ef, &mut pf);
    }
    fs.eput(parent);
    fs.eput(ep);
    0
}

fn sys_exec() -> isize {
    let mut path = [0u8; FAT32_MAX_FILENAME + 1];
    if argstr(0, &mut path).is_err() {
        return -1;
    }
    let uargv = argaddr(1);

    // 逐个取出用户的 argv 指针与串
    let sz = proc::current_sz();
    let mut argv: Vec<Vec<u8>> = Vec::new();
    for i in 0..MAXARG {
        let mut ptr_bytes = [0u8; 8];
        if unsafe { copy_in_str_ptr(sz, uargv + i * 8, &mut ptr_bytes) }.is_err() {
            return -1;
        }
        let ptr = usize::from_ne_bytes(ptr_bytes);
        if ptr == 0 {
            break;
        }
        let mut buf = [0u8; FAT32_MAX_FILENAME + 1];
        let Ok(len) = (unsafe { copy_in_str2(sz, &mut buf, ptr) }) else {
            return -1;
        };
        argv.push(buf[..len].to_vec());
    }

    exec::exec(path_bytes(&path), &argv)
}

/// 读用户空间的一个指针字。
unsafe fn copy_in_str_ptr(sz: usize, addr: usize, dst: &mut [u8; 8]) -> Result<(), ()> {
    kernel_vm::copy_in2(sz, dst, addr)
}

fn path_bytes(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}
