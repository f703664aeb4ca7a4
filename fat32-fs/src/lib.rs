//! fat32-fs: 缓冲块层与 FAT32 文件系统
//!
//! 下层是带睡眠锁的定长块缓存（LRU 复用），上层是 FAT32 的
//! 目录项缓存、长文件名装配、簇链定位与文件读写。
//! 设备以 `Arc<dyn BlockDevice>` 注入，内核给 virtio 磁盘，
//! 测试给内存里的模拟设备。

#![no_std]

extern crate alloc;

mod bio;
mod block_dev;
mod entry;
mod fs;
mod layout;
mod path;

pub use bio::{Buf, BufCache, NBUF};
pub use block_dev::{BlockDevice, BLOCK_SZ};
pub use entry::{Ent, EntryFile, Stat, T_DEVICE, T_DIR, T_FILE};
pub use fs::FatFs;
pub use layout::{
    Attr, FatVolume, ATTR_LONG_NAME, CHAR_LONG_NAME, CHAR_SHORT_NAME, EMPTY_ENTRY,
    ENTRY_CACHE_NUM, FAT32_EOC, FAT32_MAX_FILENAME, FAT32_MAX_PATH, LAST_LONG_ENTRY,
    STAT_MAX_NAME,
};
pub use entry::{cal_checksum, formatname, generate_shortname};
