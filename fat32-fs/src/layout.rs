//! FAT32 盘上布局
//!
//! BPB 字段、目录项编码与簇号算术。所有多字节量皆小端，
//! 按字节拼装，不依赖结构体对齐。

use crate::block_dev::BLOCK_SZ;

bitflags::bitflags! {
    /// 目录项属性字节。
    pub struct Attr: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// 长文件名项的属性字节（RO|HIDDEN|SYSTEM|VOLUME_ID）。
pub const ATTR_LONG_NAME: u8 = 0x0f;

/// 长文件名链中最后（最先写盘）一项的序号标记位。
pub const LAST_LONG_ENTRY: u8 = 0x40;
/// 簇链终结：不小于该值的 FAT 表项都表示链尾。
pub const FAT32_EOC: u32 = 0x0fff_fff8;
/// 已删除目录项的首字节。
pub const EMPTY_ENTRY: u8 = 0xe5;
/// 目录表尾的首字节。
pub const END_OF_ENTRY: u8 = 0x00;
/// 每个长文件名项携带的 UTF-16 单元数。
pub const CHAR_LONG_NAME: usize = 13;
/// 8.3 短名长度。
pub const CHAR_SHORT_NAME: usize = 11;

pub const FAT32_MAX_FILENAME: usize = 255;
pub const FAT32_MAX_PATH: usize = 260;
pub const ENTRY_CACHE_NUM: usize = 50;
/// 盘上目录项定长 32 字节。
pub const DENTRY_SIZE: usize = 32;

pub const STAT_MAX_NAME: usize = 32;

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// 短名项（SNE）字段偏移。
pub(crate) const SNE_NAME: usize = 0;
pub(crate) const SNE_ATTR: usize = 11;
pub(crate) const SNE_FST_CLUS_HI: usize = 20;
pub(crate) const SNE_FST_CLUS_LO: usize = 26;
pub(crate) const SNE_FILE_SIZE: usize = 28;

/// 长名项（LNE）的 13 个 UTF-16 单元在 32 字节里的偏移：
/// name1 五个、name2 六个、name3 两个。
pub(crate) const LNE_ORDER: usize = 0;
pub(crate) const LNE_ATTR: usize = 11;
pub(crate) const LNE_CHECKSUM: usize = 13;
pub(crate) const LNE_UNIT_OFF: [usize; CHAR_LONG_NAME] =
    [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// 启动扇区解析出的卷参数与派生几何。挂载后只读。
pub struct FatVolume {
    pub byts_per_sec: u32,
    pub sec_per_clus: u32,
    pub rsvd_sec_cnt: u32,
    pub fat_cnt: u32,
    pub hidd_sec: u32,
    pub tot_sec: u32,
    pub fat_sz: u32,
    pub root_clus: u32,

    pub first_data_sec: u32,
    pub data_sec_cnt: u32,
    pub data_clus_cnt: u32,
    pub byts_per_clus: u32,
}

impl FatVolume {
    /// 解析 0 号扇区。卷标或扇区大小不符直接终止：
    /// 启动卷坏了没有可恢复的余地。
    pub fn parse(sector0: &[u8]) -> Self {
        assert!(&sector0[82..87] == b"FAT32", "not FAT32 volume");

        let byts_per_sec = read_u16(sector0, 11) as u32;
        let sec_per_clus = sector0[13] as u32;
        let rsvd_sec_cnt = read_u16(sector0, 14) as u32;
        let fat_cnt = sector0[16] as u32;
        let hidd_sec = read_u32(sector0, 28);
        let tot_sec = read_u32(sector0, 32);
        let fat_sz = read_u32(sector0, 36);
        let root_clus = read_u32(sector0, 44);

        assert!(byts_per_sec as usize == BLOCK_SZ, "byts_per_sec != BSIZE");

        let first_data_sec = rsvd_sec_cnt + fat_cnt * fat_sz;
        let data_sec_cnt = tot_sec - first_data_sec;
        let data_clus_cnt = data_sec_cnt / sec_per_clus;
        let byts_per_clus = sec_per_clus * byts_per_sec;

        Self {
            byts_per_sec,
            sec_per_clus,
            rsvd_sec_cnt,
            fat_cnt,
            hidd_sec,
            tot_sec,
            fat_sz,
            root_clus,
            first_data_sec,
            data_sec_cnt,
            data_clus_cnt,
            byts_per_clus,
        }
    }

    /// 簇号对应的第一个数据扇区。簇号从 2 起算。
    pub fn first_sec_of_clus(&self, cluster: u32) -> u32 {
        (cluster - 2) * self.sec_per_clus + self.first_data_sec
    }

    /// 簇号在第 fat_num 份 FAT 表中所在的扇区。
    pub fn fat_sec_of_clus(&self, cluster: u32, fat_num: u32) -> u32 {
        self.rsvd_sec_cnt + (cluster * 4) / self.byts_per_sec + self.fat_sz * (fat_num - 1)
    }

    /// 簇号的表项在扇区内的字节偏移。
    pub fn fat_offset_of_clus(&self, cluster: u32) -> u32 {
        (cluster * 4) % self.byts_per_sec
    }
}
