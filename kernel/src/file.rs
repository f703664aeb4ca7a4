//! 文件层：打开文件对象与设备分发表。
//!
//! 打开的文件是引用计数对象（fork 复制句柄即克隆计数），
//! 最后一个句柄消失时归还目录项引用。设备按主设备号分发到
//! 注册的 read/write 实现。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use fat32_fs::{Ent, FatFs, Stat};
use spin::Once;

use crate::console;

pub const CONSOLE: usize = 1;
pub const NDEV: usize = 8;

/// 按主设备号分发的设备接口。
pub trait Device: Send + Sync {
    fn read(&self, dst: &mut [u8]) -> isize;
    fn write(&self, src: &[u8]) -> isize;
}

const DEVSW_INIT: Once<&'static dyn Device> = Once::new();
static DEVSW: [Once<&'static dyn Device>; NDEV] = [DEVSW_INIT; NDEV];

struct ConsoleDev;

impl Device for ConsoleDev {
    fn read(&self, dst: &mut [u8]) -> isize {
        console::console_read(dst)
    }

    fn write(&self, src: &[u8]) -> isize {
        console::console_write(src)
    }
}

static CONSOLE_DEV: ConsoleDev = ConsoleDev;

/// 注册内建设备。
pub fn init() {
    DEVSW[CONSOLE].call_once(|| &CONSOLE_DEV);
}

fn devsw(major: usize) -> Option<&'static dyn Device> {
    DEVSW.get(major)?.get().copied()
}

static FS: Once<Arc<FatFs>> = Once::new();

/// 首个进程挂载文件系统后注册。
pub fn set_fs(fs: Arc<FatFs>) {
    FS.call_once(|| fs);
}

pub fn fs() -> &'static Arc<FatFs> {
    FS.get().expect("filesystem not mounted")
}

pub enum FileKind {
    Entry { ent: Ent },
    Device { major: usize },
    Closed,
}

/// 一个打开的文件。偏移原子推进；共享句柄的并发读写
/// 之间不保证次序。
pub struct File {
    pub readable: bool,
    pub writable: bool,
    pub kind: FileKind,
    pub off: AtomicU32,
}

impl File {
    pub fn new_entry(readable: bool, writable: bool, ent: Ent) -> Arc<File> {
        Arc::new(File {
            readable,
            writable,
            kind: FileKind::Entry { ent },
            off: AtomicU32::new(0),
        })
    }

    pub fn new_device(readable: bool, writable: bool, major: usize) -> Arc<File> {
        Arc::new(File {
            readable,
            writable,
            kind: FileKind::Device { major },
            off: AtomicU32::new(0),
        })
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let FileKind::Entry { ent } = core::mem::replace(&mut self.kind, FileKind::Closed) {
            fs().eput(ent);
        }
    }
}

pub fn fileread(f: &File, dst: &mut [u8]) -> isize {
    if !f.readable {
        return -1;
    }
    match &f.kind {
        FileKind::Device { major } => match devsw(*major) {
            Some(dev) => dev.read(dst),
            None => -1,
        },
        FileKind::Entry { ent } => {
            let fs = fs();
            let mut ef = fs.elock(ent);
            let off = f.off.load(Ordering::SeqCst);
            let r = fs.eread(&mut ef, off, dst);
            f.off.fetch_add(r as u32, Ordering::SeqCst);
            r as isize
        }
        FileKind::Closed => -1,
    }
}

pub fn filewrite(f: &File, src: &[u8]) -> isize {
    if !f.writable {
        return -1;
    }
    match &f.kind {
        FileKind::Device { major } => match devsw(*major) {
            Some(dev) => dev.write(src),
            None => -1,
        },
        FileKind::Entry { ent } => {
            let fs = fs();
            let mut ef = fs.elock(ent);
            let off = f.off.load(Ordering::SeqCst);
            match fs.ewrite(&mut ef, off, src) {
                Some(n) => {
                    f.off.fetch_add(n as u32, Ordering::SeqCst);
                    n as isize
                }
                None => -1,
            }
        }
        FileKind::Closed => -1,
    }
}

pub fn filestat(f: &File) -> Option<Stat> {
    match &f.kind {
        FileKind::Entry { ent } => {
            let fs = fs();
            let ef = fs.elock(ent);
            Some(fs.estat(ent, &ef))
        }
        _ => None,
    }
}
