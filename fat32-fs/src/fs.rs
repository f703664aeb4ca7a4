//! FAT32 文件系统对象
//!
//! 持有块缓存、卷参数与目录项缓存。簇层通过块缓存做
//! 读-改-写（写穿），目录项层在其上实现查找、创建、删除与读写。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use sync::{SleepGuard, SleepLock, SpinLock};

use crate::bio::BufCache;
use crate::block_dev::{BlockDevice, BLOCK_SZ};
use crate::entry::*;
use crate::layout::*;

/// 目录扫描的一步。
pub(crate) enum Enext {
    /// 目录表到头（首字节 0x00）或越过链尾。
    End,
    /// 一段连续的已删除槽位，长度为项数。
    Empty(u32),
    /// 读到一个短名项，连同前导长名项共占 n 项。
    Entry(u32),
}

pub struct FatFs {
    pub(crate) bcache: BufCache,
    pub(crate) vol: FatVolume,
    pub(crate) ecache: SpinLock<EcacheInner>,
    pub(crate) files: Box<[SleepLock<EntryFile>]>,
}

impl FatFs {
    /// 挂载 0 号设备上的 FAT32 卷。卷不合法直接终止。
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Arc<FatFs> {
        let bcache = BufCache::new(Arc::clone(&dev));
        let vol = {
            let b = bcache.bread(0, 0);
            FatVolume::parse(&*b)
        };
        log::info!(
            "fat32: {} sectors, {} sectors/cluster, root cluster {}",
            vol.tot_sec,
            vol.sec_per_clus,
            vol.root_clus
        );

        let mut slots = Vec::with_capacity(ENTRY_CACHE_NUM + 1);
        for i in 0..=ENTRY_CACHE_NUM {
            slots.push(SlotMeta {
                ref_cnt: 0,
                valid: if i == ROOT_SLOT { 1 } else { 0 },
                dev: 0,
                parent: ROOT_SLOT,
                prev: i,
                next: i,
                name: [0; FAT32_MAX_FILENAME + 1],
            });
        }
        let mut inner = EcacheInner {
            slots: slots.into_boxed_slice(),
        };
        inner.slots[ROOT_SLOT].name[0] = b'/';
        for i in 0..ENTRY_CACHE_NUM {
            inner.attach_front(i);
        }

        let mut files = Vec::with_capacity(ENTRY_CACHE_NUM + 1);
        for i in 0..=ENTRY_CACHE_NUM {
            let mut ef = EntryFile::empty();
            if i == ROOT_SLOT {
                ef.attribute = Attr::DIRECTORY | Attr::SYSTEM;
                ef.first_clus = vol.root_clus;
                ef.cur_clus = vol.root_clus;
                ef.filename[0] = b'/';
            }
            files.push(SleepLock::new(ef));
        }

        Arc::new(FatFs {
            bcache,
            vol,
            ecache: SpinLock::new(inner),
            files: files.into_boxed_slice(),
        })
    }

    pub fn vol(&self) -> &FatVolume {
        &self.vol
    }

    /// 根目录的一个新引用。
    pub fn root(&self) -> Ent {
        let mut inner = self.ecache.lock();
        inner.slots[ROOT_SLOT].ref_cnt += 1;
        Ent(ROOT_SLOT)
    }

    pub fn is_root(&self, e: &Ent) -> bool {
        e.slot() == ROOT_SLOT
    }

    fn slot_valid(&self, slot: usize) -> i8 {
        self.ecache.lock().slots[slot].valid
    }

    pub fn entry_dev(&self, e: &Ent) -> u32 {
        self.ecache.lock().slots[e.slot()].dev
    }

    // =========================================================================
    // FAT 表与簇
    // =========================================================================

    /// 读 FAT 表项。链尾值原样返回；越界簇号返回 0。
    pub fn read_fat(&self, cluster: u32) -> u32 {
        if cluster >= FAT32_EOC {
            return cluster;
        }
        if cluster > self.vol.data_clus_cnt + 1 {
            return 0;
        }
        let sec = self.vol.fat_sec_of_clus(cluster, 1);
        let b = self.bcache.bread(0, sec);
        read_u32(&*b, self.vol.fat_offset_of_clus(cluster) as usize)
    }

    /// 写 FAT 表项（只维护第一份 FAT），写穿后返回。
    pub(crate) fn write_fat(&self, cluster: u32, content: u32) -> Result<(), ()> {
        if cluster > self.vol.data_clus_cnt + 1 {
            return Err(());
        }
        let sec = self.vol.fat_sec_of_clus(cluster, 1);
        let mut b = self.bcache.bread(0, sec);
        write_u32(&mut *b, self.vol.fat_offset_of_clus(cluster) as usize, content);
        b.write();
        Ok(())
    }

    /// 把簇的所有扇区写成零。
    fn zero_clus(&self, cluster: u32) {
        let mut sec = self.vol.first_sec_of_clus(cluster);
        for _ in 0..self.vol.sec_per_clus {
            let mut b = self.bcache.bread(0, sec);
            b.fill(0);
            b.write();
            sec += 1;
        }
    }

    /// 线性扫描 FAT 找第一个空闲表项，写链尾值占住并清零数据簇。
    /// 没有空闲簇是致命错误。
    pub(crate) fn alloc_clus(&self) -> u32 {
        let ent_per_sec = self.vol.byts_per_sec / 4;
        let mut sec = self.vol.rsvd_sec_cnt;
        for i in 0..self.vol.fat_sz {
            let mut b = self.bcache.bread(0, sec);
            for j in 0..ent_per_sec {
                if read_u32(&*b, (j * 4) as usize) == 0 {
                    write_u32(&mut *b, (j * 4) as usize, FAT32_EOC + 7);
                    b.write();
                    drop(b);
                    let clus = i * ent_per_sec + j;
                    self.zero_clus(clus);
                    return clus;
                }
            }
            drop(b);
            sec += 1;
        }
        panic!("no clusters");
    }

    pub(crate) fn free_clus(&self, cluster: u32) {
        let _ = self.write_fat(cluster, 0);
    }

    /// 簇内读：从簇的 off 字节起填满 dst（不跨簇）。
    fn read_clus(&self, cluster: u32, off: u32, dst: &mut [u8]) -> usize {
        assert!(
            off as usize + dst.len() <= self.vol.byts_per_clus as usize,
            "offset out of range"
        );
        let mut sec = self.vol.first_sec_of_clus(cluster) + off / self.vol.byts_per_sec;
        let mut off_in = (off % self.vol.byts_per_sec) as usize;
        let mut tot = 0;
        while tot < dst.len() {
            let b = self.bcache.bread(0, sec);
            let m = (BLOCK_SZ - off_in).min(dst.len() - tot);
            dst[tot..tot + m].copy_from_slice(&b[off_in..off_in + m]);
            tot += m;
            off_in = 0;
            sec += 1;
        }
        tot
    }

    /// 簇内写：读-改-写穿每个覆盖到的扇区。
    fn write_clus(&self, cluster: u32, off: u32, src: &[u8]) -> usize {
        assert!(
            off as usize + src.len() <= self.vol.byts_per_clus as usize,
            "offset out of range"
        );
        let mut sec = self.vol.first_sec_of_clus(cluster) + off / self.vol.byts_per_sec;
        let mut off_in = (off % self.vol.byts_per_sec) as usize;
        let mut tot = 0;
        while tot < src.len() {
            let mut b = self.bcache.bread(0, sec);
            let m = (BLOCK_SZ - off_in).min(src.len() - tot);
            b[off_in..off_in + m].copy_from_slice(&src[tot..tot + m]);
            b.write();
            tot += m;
            off_in = 0;
            sec += 1;
        }
        tot
    }

    /// 把 (cur_clus, clus_cnt) 推进到文件第 off 字节所在的簇。
    /// 目标在链尾之后时：alloc 则挂新簇，否则回到链头并返回 None。
    /// 返回簇内偏移。
    pub(crate) fn reloc_clus(&self, ef: &mut EntryFile, off: u32, alloc: bool) -> Option<u32> {
        let clus_num = off / self.vol.byts_per_clus;

        while clus_num > ef.clus_cnt {
            let mut clus = self.read_fat(ef.cur_clus);
            if clus >= FAT32_EOC {
                if alloc {
                    clus = self.alloc_clus();
                    let _ = self.write_fat(ef.cur_clus, clus);
                } else {
                    ef.cur_clus = ef.first_clus;
                    ef.clus_cnt = 0;
                    return None;
                }
            }
            ef.cur_clus = clus;
            ef.clus_cnt += 1;
        }

        if clus_num < ef.clus_cnt {
            ef.cur_clus = ef.first_clus;
            ef.clus_cnt = 0;
            while ef.clus_cnt < clus_num {
                ef.cur_clus = self.read_fat(ef.cur_clus);
                assert!(ef.cur_clus < FAT32_EOC, "reloc_clus");
                ef.clus_cnt += 1;
            }
        }
        Some(off % self.vol.byts_per_clus)
    }

    // =========================================================================
    // 文件读写
    // =========================================================================

    /// 从 off 读至多 dst.len() 字节。目录、越界或链尾都按读到 0 处理。
    /// 调用方持有该项的睡眠锁。
    pub fn eread(&self, ef: &mut EntryFile, mut off: u32, dst: &mut [u8]) -> usize {
        if off > ef.file_size || ef.attribute.contains(Attr::DIRECTORY) {
            return 0;
        }
        let n = (dst.len() as u64).min((ef.file_size - off) as u64) as u32;
        let mut tot: u32 = 0;
        while ef.cur_clus < FAT32_EOC && tot < n {
            if self.reloc_clus(ef, off, false).is_none() {
                break;
            }
            let in_clus = off % self.vol.byts_per_clus;
            let m = (self.vol.byts_per_clus - in_clus).min(n - tot);
            let dst_range = &mut dst[tot as usize..(tot + m) as usize];
            if self.read_clus(ef.cur_clus, in_clus, dst_range) != m as usize {
                break;
            }
            tot += m;
            off += m;
        }
        tot as usize
    }

    /// 从 off 写入 src，按需延长簇链并更新文件大小。
    /// off 超过文件尾、32 位大小溢出或只读项返回 None。
    /// 调用方持有该项的睡眠锁。
    pub fn ewrite(&self, ef: &mut EntryFile, mut off: u32, src: &[u8]) -> Option<usize> {
        if off > ef.file_size
            || (off as u64 + src.len() as u64) > u32::MAX as u64
            || ef.attribute.contains(Attr::READ_ONLY)
        {
            return None;
        }
        if ef.first_clus == 0 {
            // 空文件：先挂上首簇
            let clus = self.alloc_clus();
            ef.cur_clus = clus;
            ef.first_clus = clus;
            ef.clus_cnt = 0;
            ef.dirty = true;
        }
        let n = src.len() as u32;
        let mut tot: u32 = 0;
        while tot < n {
            self.reloc_clus(ef, off, true);
            let in_clus = off % self.vol.byts_per_clus;
            let m = (self.vol.byts_per_clus - in_clus).min(n - tot);
            let src_range = &src[tot as usize..(tot + m) as usize];
            if self.write_clus(ef.cur_clus, in_clus, src_range) != m as usize {
                break;
            }
            tot += m;
            off += m;
        }
        if n > 0 && off > ef.file_size {
            ef.file_size = off;
            ef.dirty = true;
        }
        Some(tot as usize)
    }

    /// 释放整条簇链并把文件截成空。
    pub fn etrunc(&self, ef: &mut EntryFile) {
        let mut clus = ef.first_clus;
        while (2..FAT32_EOC).contains(&clus) {
            let next = self.read_fat(clus);
            self.free_clus(clus);
            clus = next;
        }
        ef.file_size = 0;
        ef.first_clus = 0;
        ef.cur_clus = 0;
        ef.clus_cnt = 0;
        ef.dirty = true;
    }

    pub fn estat(&self, e: &Ent, ef: &EntryFile) -> Stat {
        let mut st = Stat {
            name: [0; STAT_MAX_NAME + 1],
            dev: self.entry_dev(e),
            type_: if ef.is_dir() { T_DIR } else { T_FILE },
            size: ef.file_size as u64,
        };
        let name = ef.name();
        let n = name.len().min(STAT_MAX_NAME);
        st.name[..n].copy_from_slice(&name[..n]);
        st
    }

    // =========================================================================
    // 目录项缓存
    // =========================================================================

    /// 先按 (parent, name) 找缓存命中，否则从 LRU 端要一个空槽。
    /// 槽位耗尽说明引用泄漏，直接终止。
    fn eget(&self, dp: &Ent, name: Option<&[u8]>) -> Ent {
        let mut inner = self.ecache.lock();
        if let Some(name) = name {
            let mut i = inner.slots[ROOT_SLOT].next;
            while i != ROOT_SLOT {
                if inner.slots[i].valid == 1
                    && inner.slots[i].parent == dp.slot()
                    && inner.slot_name(i) == name
                {
                    inner.slots[i].ref_cnt += 1;
                    if inner.slots[i].ref_cnt == 1 {
                        let parent = inner.slots[i].parent;
                        inner.slots[parent].ref_cnt += 1;
                    }
                    return Ent(i);
                }
                i = inner.slots[i].next;
            }
        }

        let mut i = inner.slots[ROOT_SLOT].prev;
        while i != ROOT_SLOT {
            if inner.slots[i].ref_cnt == 0 {
                let dev = inner.slots[dp.slot()].dev;
                let slot = &mut inner.slots[i];
                slot.ref_cnt = 1;
                slot.dev = dev;
                slot.valid = 0;
                return Ent(i);
            }
            i = inner.slots[i].prev;
        }
        panic!("eget: insufficient ecache");
    }

    /// 父目录项的一个新引用。
    pub fn parent_of(&self, e: &Ent) -> Ent {
        let mut inner = self.ecache.lock();
        let parent = inner.slots[e.slot()].parent;
        inner.slots[parent].ref_cnt += 1;
        Ent(parent)
    }

    /// 目录除 "." 与 ".." 外是否为空。调用方持有其睡眠锁。
    pub fn dir_is_empty(&self, dpf: &mut EntryFile) -> bool {
        let mut scratch = EntryFile::empty();
        let mut off = 2 * DENTRY_SIZE as u32;
        loop {
            match self.enext(dpf, &mut scratch, off) {
                Enext::End => return true,
                Enext::Empty(cnt) => off += cnt * DENTRY_SIZE as u32,
                Enext::Entry(_) => return false,
            }
        }
    }

    /// 引用计数加一。
    pub fn edup(&self, e: &Ent) -> Ent {
        let mut inner = self.ecache.lock();
        inner.slots[e.slot()].ref_cnt += 1;
        Ent(e.slot())
    }

    /// 取目录项的睡眠锁。
    pub fn elock(&self, e: &Ent) -> SleepGuard<'_, EntryFile> {
        assert!(self.ecache.lock().slots[e.slot()].ref_cnt >= 1, "elock");
        self.files[e.slot()].lock()
    }

    /// 归还一个引用。最后一个引用离开时把槽位挪到 LRU 链头，
    /// 已删除的项释放簇链，否则把元数据同步回父目录，
    /// 然后沿父链继续归还（深度受目录深度限制）。
    pub fn eput(&self, ent: Ent) {
        let mut slot = ent.slot();
        loop {
            let mut inner = self.ecache.lock();
            if slot != ROOT_SLOT && inner.slots[slot].valid != 0 && inner.slots[slot].ref_cnt == 1
            {
                // 还有最后一个引用在本线程手里，睡眠锁必然空闲
                inner.detach(slot);
                inner.attach_front(slot);
                let parent = inner.slots[slot].parent;
                let valid = inner.slots[slot].valid;
                drop(inner);

                let mut ef = self.files[slot].lock();
                if valid == -1 {
                    self.etrunc(&mut ef);
                } else {
                    let mut pf = self.files[parent].lock();
                    self.eupdate(&mut ef, &mut pf);
                }
                drop(ef);

                let mut inner = self.ecache.lock();
                inner.slots[slot].ref_cnt -= 1;
                let last = inner.slots[slot].ref_cnt == 0;
                drop(inner);
                if last {
                    // 递归释放父项
                    slot = parent;
                    continue;
                }
                return;
            }
            inner.slots[slot].ref_cnt -= 1;
            return;
        }
    }

    /// 把 first_clus 与 file_size 写回父目录里的短名项。
    /// 调用方持有子项与父项的睡眠锁。
    pub fn eupdate(&self, ef: &mut EntryFile, pf: &mut EntryFile) {
        if !ef.dirty {
            return;
        }
        // 首字节的序号给出前导长名项个数，短名项紧随其后
        let Some(off) = self.reloc_clus(pf, ef.off, false) else {
            return;
        };
        let mut first = [0u8; 1];
        self.read_clus(pf.cur_clus, off, &mut first);
        let entcnt = (first[0] & !LAST_LONG_ENTRY) as u32;
        let Some(off) = self.reloc_clus(pf, ef.off + (entcnt << 5), false) else {
            return;
        };
        let mut de = [0u8; DENTRY_SIZE];
        self.read_clus(pf.cur_clus, off, &mut de);
        write_u16(&mut de, SNE_FST_CLUS_HI, (ef.first_clus >> 16) as u16);
        write_u16(&mut de, SNE_FST_CLUS_LO, (ef.first_clus & 0xffff) as u16);
        write_u32(&mut de, SNE_FILE_SIZE, ef.file_size);
        self.write_clus(pf.cur_clus, off, &de);
        ef.dirty = false;
    }

    /// 把该项的长名链与短名项全部打上删除标记，
    /// 槽位转为待释放状态，最后一个引用离开时回收簇链。
    /// 调用方持有子项与父项的睡眠锁。
    pub fn eremove(&self, e: &Ent, ef: &mut EntryFile, pf: &mut EntryFile) {
        if self.slot_valid(e.slot()) != 1 {
            return;
        }
        let mut off = ef.off;
        let mut off2 = match self.reloc_clus(pf, off, false) {
            Some(o) => o,
            None => return,
        };
        let mut first = [0u8; 1];
        self.read_clus(pf.cur_clus, off2, &mut first);
        let entcnt = (first[0] & !LAST_LONG_ENTRY) as u32;

        for _ in 0..=entcnt {
            self.write_clus(pf.cur_clus, off2, &[EMPTY_ENTRY]);
            off += DENTRY_SIZE as u32;
            match self.reloc_clus(pf, off, false) {
                Some(o) => off2 = o,
                None => break,
            }
        }
        self.ecache.lock().slots[e.slot()].valid = -1;
    }

    /// 读 dp 偏移 off 处的一个目录项。长名项逐段拼进 epf 的
    /// 文件名缓冲，直到短名项成行返回；没有长名时从 8.3 字段还原。
    pub(crate) fn enext(&self, dpf: &mut EntryFile, epf: &mut EntryFile, off: u32) -> Enext {
        assert!(dpf.attribute.contains(Attr::DIRECTORY), "enext not dir");
        assert!(off % DENTRY_SIZE as u32 == 0, "enext not align");

        epf.filename = [0; FAT32_MAX_FILENAME + 1];
        let mut off = off;
        let mut empty_run: u32 = 0;
        let mut lfn_total: Option<u32> = None;
        loop {
            let Some(off2) = self.reloc_clus(dpf, off, false) else {
                return Enext::End;
            };
            let mut de = [0u8; DENTRY_SIZE];
            if self.read_clus(dpf.cur_clus, off2, &mut de) != DENTRY_SIZE
                || de[LNE_ORDER] == END_OF_ENTRY
            {
                return Enext::End;
            }
            if de[LNE_ORDER] == EMPTY_ENTRY {
                empty_run += 1;
                off += DENTRY_SIZE as u32;
                continue;
            }
            if empty_run > 0 {
                return Enext::Empty(empty_run);
            }

            if de[LNE_ATTR] == ATTR_LONG_NAME {
                let lcnt = (de[LNE_ORDER] & !LAST_LONG_ENTRY) as usize;
                if (de[LNE_ORDER] & LAST_LONG_ENTRY) != 0 {
                    lfn_total = Some(lcnt as u32 + 1);
                }
                lfn_name_into(&mut epf.filename, lcnt, &de);
            } else {
                let total = match lfn_total {
                    Some(n) => n,
                    None => {
                        // 裸短名项：从 8.3 字段还原名字
                        short_name_into(&mut epf.filename, &de);
                        1
                    }
                };
                entry_info_into(epf, &de);
                return Enext::Entry(total);
            }
            off += DENTRY_SIZE as u32;
        }
    }

    /// 在 dp 下查找 name。"." 与 ".." 走缓存父链；其余先查缓存，
    /// 未命中则扫描目录。`poff` 输出第一段足以容纳
    /// ⌈|name|/13⌉+1 个项的删除槽位（或目录尾），供 ealloc 落位。
    /// 调用方持有 dp 的睡眠锁（dpf 即其内容）。
    pub fn dirlookup(
        &self,
        dp: &Ent,
        dpf: &mut EntryFile,
        name: &[u8],
        mut poff: Option<&mut u32>,
    ) -> Option<Ent> {
        assert!(dpf.attribute.contains(Attr::DIRECTORY), "dirlookup not DIR");
        if name == b"." {
            return Some(self.edup(dp));
        }
        if name == b".." {
            if dp.slot() == ROOT_SLOT {
                return Some(self.root());
            }
            let mut inner = self.ecache.lock();
            let parent = inner.slots[dp.slot()].parent;
            inner.slots[parent].ref_cnt += 1;
            return Some(Ent(parent));
        }
        if self.slot_valid(dp.slot()) != 1 {
            return None;
        }

        let ep = self.eget(dp, Some(name));
        if self.slot_valid(ep.slot()) == 1 {
            return Some(ep);
        }

        let entcnt = (name.len() + CHAR_LONG_NAME - 1) / CHAR_LONG_NAME + 1;
        let mut off: u32 = 0;
        self.reloc_clus(dpf, 0, false);

        let mut epf = self.files[ep.slot()].lock();
        epf.dirty = false;
        epf.off = 0;
        loop {
            match self.enext(dpf, &mut epf, off) {
                Enext::End => break,
                Enext::Empty(cnt) => {
                    if cnt as usize >= entcnt {
                        if let Some(po) = poff.take() {
                            *po = off;
                        }
                    }
                    off += cnt * DENTRY_SIZE as u32;
                }
                Enext::Entry(cnt) => {
                    if epf.name() == name {
                        epf.off = off;
                        let slot_name = epf.filename;
                        drop(epf);
                        let mut inner = self.ecache.lock();
                        inner.slots[ep.slot()].parent = dp.slot();
                        inner.slots[dp.slot()].ref_cnt += 1;
                        inner.slots[ep.slot()].valid = 1;
                        inner.slots[ep.slot()].name = slot_name;
                        return Some(ep);
                    }
                    off += cnt * DENTRY_SIZE as u32;
                }
            }
        }
        if let Some(po) = poff.take() {
            *po = off;
        }
        drop(epf);
        self.eput(ep);
        None
    }

    /// 把一条目录项链写进 dp：off 为 0/32 时写 "."、".."，
    /// 否则按名字长度写 n 个长名项再写短名项。
    /// 调用方持有 dp 的睡眠锁。
    fn emake(
        &self,
        dpf: &mut EntryFile,
        name: &[u8],
        attr: Attr,
        first_clus: u32,
        file_size: u32,
        off: u32,
    ) {
        assert!(dpf.attribute.contains(Attr::DIRECTORY), "emake: not dir");
        assert!(off % DENTRY_SIZE as u32 == 0, "emake: not aligned");

        if off <= DENTRY_SIZE as u32 {
            let mut de = [0u8; DENTRY_SIZE];
            let dot: &[u8] = if off == 0 { b".          " } else { b"..         " };
            de[..CHAR_SHORT_NAME].copy_from_slice(dot);
            de[SNE_ATTR] = Attr::DIRECTORY.bits();
            write_u16(&mut de, SNE_FST_CLUS_HI, (first_clus >> 16) as u16);
            write_u16(&mut de, SNE_FST_CLUS_LO, (first_clus & 0xffff) as u16);
            let off2 = self.reloc_clus(dpf, off, true).unwrap();
            self.write_clus(dpf.cur_clus, off2, &de);
            return;
        }

        let entcnt = (name.len() + CHAR_LONG_NAME - 1) / CHAR_LONG_NAME;
        let shortname = generate_shortname(name);
        let checksum = cal_checksum(&shortname);

        let mut off = off;
        for i in (1..=entcnt).rev() {
            let mut de = [0u8; DENTRY_SIZE];
            de[LNE_ORDER] = i as u8;
            if i == entcnt {
                de[LNE_ORDER] |= LAST_LONG_ENTRY;
            }
            de[LNE_ATTR] = ATTR_LONG_NAME;
            de[LNE_CHECKSUM] = checksum;
            let units = lfn_units_from(name, (i - 1) * CHAR_LONG_NAME);
            for (j, &unit) in units.iter().enumerate() {
                write_u16(&mut de, LNE_UNIT_OFF[j], unit);
            }
            let off2 = self.reloc_clus(dpf, off, true).unwrap();
            self.write_clus(dpf.cur_clus, off2, &de);
            off += DENTRY_SIZE as u32;
        }

        let mut de = [0u8; DENTRY_SIZE];
        de[..CHAR_SHORT_NAME].copy_from_slice(&shortname);
        de[SNE_ATTR] = attr.bits();
        write_u16(&mut de, SNE_FST_CLUS_HI, (first_clus >> 16) as u16);
        write_u16(&mut de, SNE_FST_CLUS_LO, (first_clus & 0xffff) as u16);
        write_u32(&mut de, SNE_FILE_SIZE, file_size);
        let off2 = self.reloc_clus(dpf, off, true).unwrap();
        self.write_clus(dpf.cur_clus, off2, &de);
    }

    /// 在 dp 下创建名为 name 的新项；已存在则返回现有项。
    /// 目录项会立刻带上 "." 与 ".." 并分得首簇。
    /// 调用方持有 dp 的睡眠锁。
    pub fn ealloc(
        &self,
        dp: &Ent,
        dpf: &mut EntryFile,
        name: &[u8],
        attr: Attr,
    ) -> Option<Ent> {
        assert!(dpf.attribute.contains(Attr::DIRECTORY), "ealloc not dir");
        if self.slot_valid(dp.slot()) != 1 {
            return None;
        }
        let name = formatname(name)?;
        if name.is_empty() || name.len() > FAT32_MAX_FILENAME {
            return None;
        }

        let mut off: u32 = 0;
        if let Some(ep) = self.dirlookup(dp, dpf, name, Some(&mut off)) {
            return Some(ep);
        }

        let ep = self.eget(dp, Some(name));
        {
            let mut ef = self.files[ep.slot()].lock();
            ef.attribute = attr;
            ef.file_size = 0;
            ef.first_clus = 0;
            ef.cur_clus = 0;
            ef.clus_cnt = 0;
            ef.off = off;
            ef.dirty = false;
            ef.set_name(name);

            {
                let mut inner = self.ecache.lock();
                inner.slots[ep.slot()].parent = dp.slot();
                inner.slots[dp.slot()].ref_cnt += 1;
            }

            if attr.contains(Attr::DIRECTORY) {
                let clus = self.alloc_clus();
                ef.first_clus = clus;
                ef.cur_clus = clus;
                self.emake(&mut ef, b".", Attr::DIRECTORY, clus, 0, 0);
                self.emake(&mut ef, b"..", Attr::DIRECTORY, dpf.first_clus, 0, DENTRY_SIZE as u32);
            } else {
                ef.attribute |= Attr::ARCHIVE;
            }

            let (first_clus, attribute, file_size) = (ef.first_clus, ef.attribute, ef.file_size);
            self.emake(dpf, name, attribute, first_clus, file_size, off);

            let slot_name = ef.filename;
            drop(ef);
            let mut inner = self.ecache.lock();
            inner.slots[ep.slot()].valid = 1;
            inner.slots[ep.slot()].name = slot_name;
        }
        Some(ep)
    }
}
