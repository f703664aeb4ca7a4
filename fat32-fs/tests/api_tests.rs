//! fat32-fs crate 功能性验证测试
//!
//! 在内存里的模拟块设备上格式化一个小 FAT32 卷，
//! 验证挂载、目录项创建/查找/删除、长文件名编码、簇链与缓冲块缓存。
//! 写穿策略保证设备字节始终是最新状态，可以直接检查盘上布局。

use fat32_fs::{
    cal_checksum, formatname, generate_shortname, Attr, BlockDevice, BufCache, FatFs,
    ATTR_LONG_NAME, BLOCK_SZ, EMPTY_ENTRY, FAT32_EOC, LAST_LONG_ENTRY,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

// 卷几何：32 保留扇区 + 2×16 FAT 扇区 + 2040 数据扇区，每簇 1 扇区
const RSVD: usize = 32;
const FAT_SZ: usize = 16;
const FIRST_DATA: usize = RSVD + 2 * FAT_SZ;
const TOT_SEC: usize = FIRST_DATA + 2040;

struct MockDevice {
    blocks: Mutex<Vec<Vec<u8>>>,
    reads: AtomicUsize,
}

impl MockDevice {
    fn new(num_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![vec![0u8; BLOCK_SZ]; num_blocks]),
            reads: AtomicUsize::new(0),
        }
    }

    fn sector(&self, id: usize) -> Vec<u8> {
        self.blocks.lock().unwrap()[id].clone()
    }
}

impl BlockDevice for MockDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let blocks = self.blocks.lock().unwrap();
        buf.copy_from_slice(&blocks[block_id][..buf.len()]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[block_id][..buf.len()].copy_from_slice(buf);
    }
}

/// 格式化一个最小 FAT32 卷。
fn mkfs() -> Arc<MockDevice> {
    let dev = Arc::new(MockDevice::new(TOT_SEC));
    let mut bs = vec![0u8; BLOCK_SZ];
    bs[11..13].copy_from_slice(&(BLOCK_SZ as u16).to_le_bytes());
    bs[13] = 1; // sec_per_clus
    bs[14..16].copy_from_slice(&(RSVD as u16).to_le_bytes());
    bs[16] = 2; // fat_cnt
    bs[32..36].copy_from_slice(&(TOT_SEC as u32).to_le_bytes());
    bs[36..40].copy_from_slice(&(FAT_SZ as u32).to_le_bytes());
    bs[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    bs[82..90].copy_from_slice(b"FAT32   ");
    dev.write_block(0, &bs);

    // FAT[0]、FAT[1] 保留，FAT[2] 是根目录链尾；两份 FAT 一致
    let mut fat = vec![0u8; BLOCK_SZ];
    fat[0..4].copy_from_slice(&0x0fff_fff8u32.to_le_bytes());
    fat[4..8].copy_from_slice(&0xffff_ffffu32.to_le_bytes());
    fat[8..12].copy_from_slice(&0x0fff_ffffu32.to_le_bytes());
    dev.write_block(RSVD, &fat);
    dev.write_block(RSVD + FAT_SZ, &fat);

    // 真实镜像的根目录开头是卷标等系统项，新建文件从偏移 64 起落位
    let mut rootdir = vec![0u8; BLOCK_SZ];
    rootdir[0..11].copy_from_slice(b"BOOT       ");
    rootdir[11] = 0x08; // VOLUME_ID
    rootdir[32..43].copy_from_slice(b"SYSTEM~1   ");
    rootdir[43] = 0x04; // SYSTEM
    dev.write_block(FIRST_DATA, &rootdir);
    dev
}

fn data_sector(clus: u32) -> usize {
    FIRST_DATA + (clus as usize - 2)
}

#[test]
fn test_mount_geometry() {
    let dev = mkfs();
    let fs = FatFs::mount(dev);
    assert_eq!(fs.vol().first_data_sec as usize, FIRST_DATA);
    assert_eq!(fs.vol().byts_per_clus as usize, BLOCK_SZ);
    assert_eq!(fs.vol().root_clus, 2);
    assert_eq!(fs.vol().data_clus_cnt, 2040);
}

#[test]
#[should_panic(expected = "not FAT32 volume")]
fn test_mount_bad_magic_panics() {
    let dev = Arc::new(MockDevice::new(64));
    let _ = FatFs::mount(dev);
}

#[test]
fn test_create_write_read_small_file() {
    let dev = mkfs();
    let fs = FatFs::mount(dev.clone());
    let root = fs.root();

    let file = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, b"hello.txt", Attr::empty()).unwrap()
    };
    {
        let mut ff = fs.elock(&file);
        assert!(ff.attribute.contains(Attr::ARCHIVE));
        assert_eq!(fs.ewrite(&mut ff, 0, b"HELLO"), Some(5));
        assert_eq!(ff.file_size, 5);
        assert_ne!(ff.first_clus, 0);
        // 分配出的簇在 FAT 里写的是 0x0FFFFFFF（链尾+7）
        assert_eq!(fs.read_fat(ff.first_clus), 0x0fff_ffff);

        let mut buf = [0u8; 16];
        assert_eq!(fs.eread(&mut ff, 0, &mut buf[..5]), 5);
        assert_eq!(&buf[..5], b"HELLO");
        // 越过文件尾读到 0 字节
        assert_eq!(fs.eread(&mut ff, 5, &mut buf), 0);
        assert_eq!(fs.eread(&mut ff, 100, &mut buf), 0);
    }

    // 再查一遍命中缓存
    {
        let mut rf = fs.elock(&root);
        let again = fs.dirlookup(&root, &mut rf, b"hello.txt", None).unwrap();
        drop(rf);
        fs.eput(again);
    }
    fs.eput(file);
    fs.eput(root);
}

#[test]
fn test_persistence_across_mounts() {
    let dev = mkfs();
    {
        let fs = FatFs::mount(dev.clone());
        let root = fs.root();
        let file = {
            let mut rf = fs.elock(&root);
            fs.ealloc(&root, &mut rf, b"hello.txt", Attr::empty()).unwrap()
        };
        {
            let mut ff = fs.elock(&file);
            fs.ewrite(&mut ff, 0, b"HELLO").unwrap();
        }
        // eput 把 first_clus 与 file_size 写回父目录的短名项
        fs.eput(file);
        fs.eput(root);
    }

    let fs = FatFs::mount(dev);
    let file = fs.ename(None, b"/hello.txt").expect("file survives remount");
    {
        let mut ff = fs.elock(&file);
        assert_eq!(ff.file_size, 5);
        assert_ne!(ff.first_clus, 0);
        let mut buf = [0u8; 5];
        assert_eq!(fs.eread(&mut ff, 0, &mut buf), 5);
        assert_eq!(&buf, b"HELLO");
    }
    fs.eput(file);
}

#[test]
fn test_long_filename_on_disk_layout() {
    let dev = mkfs();
    let fs = FatFs::mount(dev.clone());
    let root = fs.root();
    let name = b"averyveryverylongfilename.txt"; // 29 字节 → 3 个长名项
    let file = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, name, Attr::empty()).unwrap()
    };

    let base = {
        let ff = fs.elock(&file);
        ff.off as usize
    };
    let sec = dev.sector(data_sector(2));
    let checksum = cal_checksum(&generate_shortname(name));
    // 序号从 3|LAST 递减到 1，随后短名项
    assert_eq!(sec[base], 3 | LAST_LONG_ENTRY);
    assert_eq!(sec[base + 32], 2);
    assert_eq!(sec[base + 64], 1);
    for off in [base, base + 32, base + 64] {
        assert_eq!(sec[off + 11], ATTR_LONG_NAME);
        assert_eq!(sec[off + 13], checksum);
    }
    let sne = &sec[base + 96..base + 128];
    assert_eq!(&sne[..11], &generate_shortname(name));
    assert_eq!(sne[11] & Attr::ARCHIVE.bits(), Attr::ARCHIVE.bits());

    fs.eput(file);
    fs.eput(root);
}

#[test]
fn test_filename_13_and_14_bytes() {
    let dev = mkfs();
    let fs = FatFs::mount(dev.clone());
    let root = fs.root();

    // 恰 13 字节：一个长名项 + 短名项
    let file = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, b"exactly13char", Attr::empty()).unwrap()
    };
    let base = {
        let ff = fs.elock(&file);
        ff.off as usize
    };
    let sec = dev.sector(data_sector(2));
    assert_eq!(sec[base], 1 | LAST_LONG_ENTRY);
    assert_ne!(sec[base + 32 + 11], ATTR_LONG_NAME); // 第二项已是短名项
    fs.eput(file);

    // 恰 14 字节：两个长名项 + 短名项
    let file = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, b"exactly14chars", Attr::empty()).unwrap()
    };
    {
        let ff = fs.elock(&file);
        let off = ff.off as usize;
        let sec = dev.sector(data_sector(2));
        assert_eq!(sec[off], 2 | LAST_LONG_ENTRY);
        assert_eq!(sec[off + 32], 1);
        assert_ne!(sec[off + 64 + 11], ATTR_LONG_NAME);
        // 最后一个长名项只装第 14 个字符：'s'、终止符、0xFFFF 填充
        assert_eq!(sec[off + 1], b's');
        assert_eq!(&sec[off + 3..off + 5], &[0, 0]);
        assert_eq!(&sec[off + 5..off + 7], &[0xff, 0xff]);
    }
    fs.eput(file);
    fs.eput(root);
}

#[test]
fn test_remove_frees_entries_and_clusters() {
    let dev = mkfs();
    let fs = FatFs::mount(dev.clone());
    let root = fs.root();
    let file = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, b"doomed.bin", Attr::empty()).unwrap()
    };
    let first_clus = {
        let mut ff = fs.elock(&file);
        fs.ewrite(&mut ff, 0, &[0xAA; 1000]).unwrap();
        ff.first_clus
    };
    assert_ne!(first_clus, 0);

    // 子先锁、父后锁，与回收路径一致
    let base = {
        let mut ff = fs.elock(&file);
        let mut rf = fs.elock(&root);
        fs.eremove(&file, &mut ff, &mut rf);
        ff.off as usize
    };
    // 目录项全部打上删除标记
    let sec = dev.sector(data_sector(2));
    assert_eq!(sec[base], EMPTY_ENTRY);
    assert_eq!(sec[base + 32], EMPTY_ENTRY);

    // 最后一个引用离开时释放簇链
    fs.eput(file);
    assert_eq!(fs.read_fat(first_clus), 0);

    // 查找不到了
    {
        let mut rf = fs.elock(&root);
        assert!(fs.dirlookup(&root, &mut rf, b"doomed.bin", None).is_none());
    }
    fs.eput(root);
}

#[test]
fn test_cluster_chain_boundary() {
    let dev = mkfs();
    let fs = FatFs::mount(dev);
    let root = fs.root();
    let file = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, b"two.bin", Attr::empty()).unwrap()
    };
    {
        let mut ff = fs.elock(&file);
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.ewrite(&mut ff, 0, &data), Some(1024));

        // 写满两簇：链长恰为 ⌈1024/512⌉ = 2
        let c1 = ff.first_clus;
        let c2 = fs.read_fat(c1);
        assert!(c2 >= 2 && c2 < FAT32_EOC);
        assert!(fs.read_fat(c2) >= FAT32_EOC);

        // 跨簇读
        let mut buf = [0u8; 100];
        assert_eq!(fs.eread(&mut ff, 480, &mut buf), 100);
        let expect: Vec<u8> = (480..580u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(&buf[..], &expect[..]);

        // 中间留洞的写被拒绝
        assert!(fs.ewrite(&mut ff, 2000, b"x").is_none());
    }
    fs.eput(file);
    fs.eput(root);
}

#[test]
fn test_readonly_write_rejected() {
    let dev = mkfs();
    let fs = FatFs::mount(dev);
    let root = fs.root();
    let file = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, b"ro.txt", Attr::READ_ONLY).unwrap()
    };
    {
        let mut ff = fs.elock(&file);
        assert!(fs.ewrite(&mut ff, 0, b"nope").is_none());
    }
    fs.eput(file);
    fs.eput(root);
}

#[test]
fn test_directory_tree_and_paths() {
    let dev = mkfs();
    let fs = FatFs::mount(dev.clone());
    let root = fs.root();

    let sub = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, b"sub", Attr::DIRECTORY).unwrap()
    };
    let sub_clus = {
        let sf = fs.elock(&sub);
        assert!(sf.is_dir());
        sf.first_clus
    };
    // 新目录的前两项是 "." 与 ".."
    let sec = dev.sector(data_sector(sub_clus));
    assert_eq!(&sec[0..2], b". ");
    assert_eq!(&sec[32..34], b"..");

    let inner = {
        let mut sf = fs.elock(&sub);
        fs.ealloc(&sub, &mut sf, b"inner.txt", Attr::empty()).unwrap()
    };
    {
        let mut inf = fs.elock(&inner);
        fs.ewrite(&mut inf, 0, b"deep").unwrap();
    }
    fs.eput(inner);
    fs.eput(sub);

    // 路径解析
    let found = fs.ename(None, b"/sub/inner.txt").expect("path resolves");
    {
        let mut ff = fs.elock(&found);
        let mut buf = [0u8; 4];
        assert_eq!(fs.eread(&mut ff, 0, &mut buf), 4);
        assert_eq!(&buf, b"deep");
    }
    fs.eput(found);

    // "/" 是根；".." 在根仍是根；空路径非法；不存在的路径为 None
    let r = fs.ename(None, b"/").unwrap();
    assert!(fs.is_root(&r));
    fs.eput(r);
    let r = fs.ename(None, b"/sub/..").unwrap();
    assert!(fs.is_root(&r));
    fs.eput(r);
    assert!(fs.ename(None, b"").is_none());
    assert!(fs.ename(None, b"/nosuch/inner.txt").is_none());

    // 父目录解析
    let mut last = [0u8; 256];
    let parent = fs.ename_parent(None, b"/sub/inner.txt", &mut last).unwrap();
    assert_eq!(&last[..9], b"inner.txt");
    {
        let pf = fs.elock(&parent);
        assert_eq!(pf.name(), b"sub");
    }
    fs.eput(parent);
    fs.eput(root);
}

#[test]
fn test_estat() {
    let dev = mkfs();
    let fs = FatFs::mount(dev);
    let root = fs.root();
    let file = {
        let mut rf = fs.elock(&root);
        fs.ealloc(&root, &mut rf, b"statme", Attr::empty()).unwrap()
    };
    {
        let mut ff = fs.elock(&file);
        fs.ewrite(&mut ff, 0, b"123456").unwrap();
        let st = fs.estat(&file, &ff);
        assert_eq!(&st.name[..6], b"statme");
        assert_eq!(st.type_, fat32_fs::T_FILE);
        assert_eq!(st.size, 6);
    }
    fs.eput(file);
    fs.eput(root);
}

#[test]
fn test_formatname_rules() {
    assert_eq!(formatname(b"  ..hello "), Some(&b"hello"[..]));
    assert_eq!(formatname(b"name.txt"), Some(&b"name.txt"[..]));
    assert!(formatname(b"bad/name").is_none());
    assert!(formatname(b"bad*name").is_none());
    assert!(formatname(b"bad\x01name").is_none());
    assert_eq!(formatname(b"trail   "), Some(&b"trail"[..]));
}

#[test]
fn test_generate_shortname() {
    assert_eq!(&generate_shortname(b"abc.txt"), b"ABC     TXT");
    assert_eq!(&generate_shortname(b"verylongname.txt"), b"VERYLONGTXT");
    assert_eq!(&generate_shortname(b"noextension"), b"NOEXTENS   ");
    assert_eq!(&generate_shortname(b"a+b"), b"A_B        ");
    assert_eq!(&generate_shortname(b"a.b.c"), b"AB      C  ");
}

#[test]
fn test_cal_checksum() {
    assert_eq!(cal_checksum(b"AAAAAAAAAAA"), 0x1c);
}

#[test]
fn test_bufcache_single_disk_read_under_contention() {
    let dev = Arc::new(MockDevice::new(256));
    let mut pattern = vec![0u8; BLOCK_SZ];
    pattern.fill(0x5a);
    dev.write_block(100, &pattern);
    dev.reads.store(0, Ordering::Relaxed);

    let cache = Arc::new(BufCache::new(dev.clone() as Arc<dyn BlockDevice>));
    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let b = cache.bread(0, 100);
            assert!(b.iter().all(|&x| x == 0x5a));
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    // 两个并发读者只触发一次磁盘读
    assert_eq!(dev.reads.load(Ordering::Relaxed), 1);
}

#[test]
fn test_bufcache_lru_reuse() {
    let dev = Arc::new(MockDevice::new(256));
    let cache = BufCache::new(dev.clone() as Arc<dyn BlockDevice>);
    // 远超容量的顺序访问依次复用 LRU 端缓冲块
    for sec in 0..200u32 {
        let b = cache.bread(0, sec);
        drop(b);
    }
    let first_reads = dev.reads.load(Ordering::Relaxed);
    assert_eq!(first_reads, 200);
    // 最近访问过的仍在缓存里
    let b = cache.bread(0, 199);
    drop(b);
    assert_eq!(dev.reads.load(Ordering::Relaxed), 200);
    // 早已淘汰的要重新读盘
    let b = cache.bread(0, 0);
    drop(b);
    assert_eq!(dev.reads.load(Ordering::Relaxed), 201);
}
