//! 目录项缓存
//!
//! 定长槽位的目录项缓存：缓存自旋锁保护引用计数、有效位、
//! 父指针与 LRU 链；每槽的睡眠锁保护文件元数据与该项的磁盘读写。
//! 一个在用的项对父项贡献恰好一个引用，最后一个引用释放时
//! 把新状态同步回父目录的盘上短名项，再沿父链逐级释放。

use crate::layout::*;

pub const T_DIR: u16 = 1;
pub const T_FILE: u16 = 2;
pub const T_DEVICE: u16 = 3;

/// 哨兵槽位：根目录项，永不淘汰、自为父项。
pub(crate) const ROOT_SLOT: usize = ENTRY_CACHE_NUM;

/// 目录项的睡眠锁保护部分。
pub struct EntryFile {
    /// NUL 结尾，长文件名装配的工作缓冲与权威文件名。
    pub filename: [u8; FAT32_MAX_FILENAME + 1],
    pub attribute: Attr,
    pub first_clus: u32,
    pub file_size: u32,

    /// 顺序访问加速：cur_clus 恒等于 first_clus 沿 FAT 走
    /// clus_cnt 步的结果，只被 reloc_clus 与读写路径推进。
    pub cur_clus: u32,
    pub clus_cnt: u32,

    /// 本项在父目录里的字节偏移（指向首个 LFN 项）。
    pub off: u32,
    pub dirty: bool,
}

impl EntryFile {
    pub(crate) fn empty() -> Self {
        Self {
            filename: [0; FAT32_MAX_FILENAME + 1],
            attribute: Attr::empty(),
            first_clus: 0,
            file_size: 0,
            cur_clus: 0,
            clus_cnt: 0,
            off: 0,
            dirty: false,
        }
    }

    /// 文件名字节（到 NUL 为止）。
    pub fn name(&self) -> &[u8] {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FAT32_MAX_FILENAME);
        &self.filename[..end]
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.filename = [0; FAT32_MAX_FILENAME + 1];
        let n = name.len().min(FAT32_MAX_FILENAME);
        self.filename[..n].copy_from_slice(&name[..n]);
    }

    pub fn is_dir(&self) -> bool {
        self.attribute.contains(Attr::DIRECTORY)
    }
}

/// 缓存自旋锁保护的槽位元数据。`name` 仅在 valid == 1 时有意义，
/// 与 EntryFile 里的文件名在置 1 的同一临界区内同步。
pub(crate) struct SlotMeta {
    pub(crate) ref_cnt: u32,
    /// 0 空槽；1 在用；-1 已从目录删除，等待释放簇链。
    pub(crate) valid: i8,
    pub(crate) dev: u32,
    pub(crate) parent: usize,
    pub(crate) prev: usize,
    pub(crate) next: usize,
    pub(crate) name: [u8; FAT32_MAX_FILENAME + 1],
}

pub(crate) struct EcacheInner {
    pub(crate) slots: alloc::boxed::Box<[SlotMeta]>,
}

impl EcacheInner {
    pub(crate) fn detach(&mut self, i: usize) {
        let (prev, next) = (self.slots[i].prev, self.slots[i].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    pub(crate) fn attach_front(&mut self, i: usize) {
        let first = self.slots[ROOT_SLOT].next;
        self.slots[i].next = first;
        self.slots[i].prev = ROOT_SLOT;
        self.slots[first].prev = i;
        self.slots[ROOT_SLOT].next = i;
    }

    pub(crate) fn slot_name(&self, i: usize) -> &[u8] {
        let buf = &self.slots[i].name;
        let end = buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FAT32_MAX_FILENAME);
        &buf[..end]
    }
}

/// 目录项句柄：对某个缓存槽位的一个计数引用。
/// 通过 [`crate::FatFs::edup`] 复制、[`crate::FatFs::eput`] 归还。
pub struct Ent(pub(crate) usize);

impl Ent {
    pub(crate) fn slot(&self) -> usize {
        self.0
    }
}

/// stat 系统调用导出的记录。
#[repr(C)]
pub struct Stat {
    pub name: [u8; STAT_MAX_NAME + 1],
    pub dev: u32,
    pub type_: u16,
    pub size: u64,
}

// =============================================================================
// 文件名规则
// =============================================================================

const ILLEGAL_CHARS: &[u8] = b"\"*/:<>?\\|";
const ILLEGAL_SHORT: &[u8] = b"+,;=[]";

/// 规整文件名：去掉前导空格和点，拒绝控制字符与保留字符，
/// 去掉尾部空格。非法返回 None。
pub fn formatname(name: &[u8]) -> Option<&[u8]> {
    let mut start = 0;
    while start < name.len() && (name[start] == b' ' || name[start] == b'.') {
        start += 1;
    }
    let name = &name[start..];
    for &c in name {
        if c < 0x20 || ILLEGAL_CHARS.contains(&c) {
            return None;
        }
    }
    let mut end = name.len();
    while end > 0 && name[end - 1] == b' ' {
        end -= 1;
    }
    Some(&name[..end])
}

/// 把任意合法长文件名折叠成 8.3 短名（空格填充）。
/// 不生成 `~N` 数字尾巴，两个不同长名可能折叠出同一短名；
/// 缓存查找按长名比较，不受影响。
pub fn generate_shortname(name: &[u8]) -> [u8; CHAR_SHORT_NAME] {
    let mut short = [b' '; CHAR_SHORT_NAME];
    // 最后一个 '.' 分隔扩展名
    let dot = name.iter().rposition(|&c| c == b'.');
    let mut i = 0;
    let mut pos = 0;
    let mut in_ext = false;
    while i < CHAR_SHORT_NAME && pos < name.len() {
        if i == 8 && !in_ext {
            match dot {
                // 基本名写满 8 个且还没轮到扩展名：跳到扩展名
                Some(d) if pos <= d => {
                    pos = d + 1;
                    in_ext = true;
                    continue;
                }
                // 没有扩展名，基本名到 8 个为止
                _ => break,
            }
        }
        let mut c = name[pos];
        pos += 1;
        if c == b' ' {
            continue;
        }
        if c == b'.' {
            if Some(pos - 1) == dot {
                // 基本名右侧已是空格填充，切到扩展名
                i = 8;
                in_ext = true;
            }
            continue;
        }
        if c.is_ascii_lowercase() {
            c = c.to_ascii_uppercase();
        } else if ILLEGAL_SHORT.contains(&c) {
            c = b'_';
        }
        short[i] = c;
        i += 1;
    }
    short
}

/// 短名校验和，写入每个长名项供一致性检查。
pub fn cal_checksum(shortname: &[u8; CHAR_SHORT_NAME]) -> u8 {
    let mut sum: u8 = 0;
    for &b in shortname.iter() {
        sum = (if (sum & 1) != 0 { 0x80u8 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(b);
    }
    sum
}

// =============================================================================
// 盘上目录项编解码
// =============================================================================

/// 长名项的 13 个单元拼进文件名缓冲（低字节，0x0000 终止）。
pub(crate) fn lfn_name_into(dst: &mut [u8; FAT32_MAX_FILENAME + 1], lcnt: usize, de: &[u8]) {
    let base = (lcnt - 1) * CHAR_LONG_NAME;
    for (i, &off) in LNE_UNIT_OFF.iter().enumerate() {
        let unit = read_u16(de, off);
        if unit == 0 {
            break;
        }
        let idx = base + i;
        if idx >= FAT32_MAX_FILENAME {
            break;
        }
        dst[idx] = (unit & 0xff) as u8;
    }
}

/// 从 8.3 字段恢复文件名：去基本名尾部空格，有扩展名则插 '.'。
pub(crate) fn short_name_into(dst: &mut [u8; FAT32_MAX_FILENAME + 1], de: &[u8]) {
    dst[..CHAR_SHORT_NAME + 2].fill(0);
    let mut i = 0;
    for j in 0..8 {
        if de[SNE_NAME + j] == b' ' {
            break;
        }
        dst[i] = de[SNE_NAME + j];
        i += 1;
    }
    if de[SNE_NAME + 8] != b' ' {
        dst[i] = b'.';
        i += 1;
        for j in 8..CHAR_SHORT_NAME {
            if de[SNE_NAME + j] == b' ' {
                break;
            }
            dst[i] = de[SNE_NAME + j];
            i += 1;
        }
    }
}

/// 短名项元数据读给缓存项；当前簇回到链头。
pub(crate) fn entry_info_into(ef: &mut EntryFile, de: &[u8]) {
    ef.attribute = Attr::from_bits_truncate(de[SNE_ATTR]);
    ef.first_clus =
        ((read_u16(de, SNE_FST_CLUS_HI) as u32) << 16) | read_u16(de, SNE_FST_CLUS_LO) as u32;
    ef.file_size = read_u32(de, SNE_FILE_SIZE);
    ef.cur_clus = ef.first_clus;
    ef.clus_cnt = 0;
}

/// 文件名第 start 字节起的 13 个 LFN 单元：NUL 写一次 0x0000，
/// 其后补 0xFFFF。
pub(crate) fn lfn_units_from(name: &[u8], start: usize) -> [u16; CHAR_LONG_NAME] {
    let mut units = [0u16; CHAR_LONG_NAME];
    let mut ended = false;
    for (j, unit) in units.iter_mut().enumerate() {
        let idx = start + j;
        if ended {
            *unit = 0xffff;
        } else if idx < name.len() {
            *unit = name[idx] as u16;
        } else {
            *unit = 0x0000;
            ended = true;
        }
    }
    units
}
