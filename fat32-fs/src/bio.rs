//! 块缓存
//!
//! NBUF 个定长缓冲块，以带哨兵的双向链表（下标索引）维护 LRU 顺序。
//! 缓存自旋锁保护链表与引用计数；每块的睡眠锁保护载荷，
//! 对同一扇区的并发读写在睡眠锁上串行化并看到同一份数据。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use sync::{SleepGuard, SleepLock, SpinLock};

use crate::block_dev::{BlockDevice, BLOCK_SZ};

pub const NBUF: usize = 30;

/// 哨兵下标。
const HEAD: usize = NBUF;

struct BufMeta {
    dev: u32,
    sectorno: u32,
    refcnt: u32,
    prev: usize,
    next: usize,
}

struct CacheInner {
    meta: [BufMeta; NBUF + 1],
}

impl CacheInner {
    fn detach(&mut self, i: usize) {
        let (prev, next) = (self.meta[i].prev, self.meta[i].next);
        self.meta[prev].next = next;
        self.meta[next].prev = prev;
    }

    fn attach_front(&mut self, i: usize) {
        let first = self.meta[HEAD].next;
        self.meta[i].next = first;
        self.meta[i].prev = HEAD;
        self.meta[first].prev = i;
        self.meta[HEAD].next = i;
    }
}

struct BufSlot {
    /// 载荷是否含有对应扇区的数据。复用缓冲块时在缓存锁内清除，
    /// 其余读写都在睡眠锁内。
    valid: AtomicBool,
    data: SleepLock<[u8; BLOCK_SZ]>,
}

/// 块缓存。同一 (dev, sector) 任一时刻至多对应一个在用缓冲块。
/// 载荷槽位在堆上，结构体本身保持小，能在一页内核栈上搬动。
pub struct BufCache {
    dev: Arc<dyn BlockDevice>,
    inner: SpinLock<CacheInner>,
    bufs: Box<[BufSlot]>,
}

impl BufCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let mut inner = CacheInner {
            meta: core::array::from_fn(|i| BufMeta {
                dev: u32::MAX,
                sectorno: u32::MAX,
                refcnt: 0,
                prev: i,
                next: i,
            }),
        };
        for i in 0..NBUF {
            inner.attach_front(i);
        }
        let mut bufs = Vec::with_capacity(NBUF);
        for _ in 0..NBUF {
            bufs.push(BufSlot {
                valid: AtomicBool::new(false),
                data: SleepLock::new([0; BLOCK_SZ]),
            });
        }
        Self {
            dev,
            inner: SpinLock::new(inner),
            bufs: bufs.into_boxed_slice(),
        }
    }

    /// 命中则引用计数加一；未命中从 LRU 端复用一个空闲块。
    /// 没有可复用的块视为缓存被引用泄漏，直接终止。
    fn bget(&self, dev: u32, sectorno: u32) -> Buf<'_> {
        let mut inner = self.inner.lock();
        let mut i = inner.meta[HEAD].next;
        while i != HEAD {
            if inner.meta[i].dev == dev && inner.meta[i].sectorno == sectorno {
                inner.meta[i].refcnt += 1;
                drop(inner);
                let guard = self.bufs[i].data.lock();
                return Buf {
                    cache: self,
                    idx: i,
                    sectorno,
                    guard: Some(guard),
                };
            }
            i = inner.meta[i].next;
        }

        let mut i = inner.meta[HEAD].prev;
        while i != HEAD {
            if inner.meta[i].refcnt == 0 {
                inner.meta[i].dev = dev;
                inner.meta[i].sectorno = sectorno;
                inner.meta[i].refcnt = 1;
                self.bufs[i].valid.store(false, Ordering::Release);
                drop(inner);
                let guard = self.bufs[i].data.lock();
                return Buf {
                    cache: self,
                    idx: i,
                    sectorno,
                    guard: Some(guard),
                };
            }
            i = inner.meta[i].prev;
        }
        panic!("bget: no buffers");
    }

    /// 取含有指定扇区数据的缓冲块。
    pub fn bread(&self, dev: u32, sectorno: u32) -> Buf<'_> {
        let mut buf = self.bget(dev, sectorno);
        if !self.bufs[buf.idx].valid.load(Ordering::Acquire) {
            self.dev
                .read_block(sectorno as usize, buf.guard.as_mut().unwrap().as_mut_slice());
            self.bufs[buf.idx].valid.store(true, Ordering::Release);
        }
        buf
    }

    /// 引用计数加一，不触碰睡眠锁。
    pub fn pin(&self, buf: &Buf<'_>) {
        let mut inner = self.inner.lock();
        inner.meta[buf.idx].refcnt += 1;
    }

    pub fn unpin(&self, buf: &Buf<'_>) {
        let mut inner = self.inner.lock();
        inner.meta[buf.idx].refcnt -= 1;
    }
}

/// 在用的缓冲块。持有期间占着该块的睡眠锁；
/// drop 即 brelse：释放睡眠锁，计数归零时移到 MRU 端。
pub struct Buf<'a> {
    cache: &'a BufCache,
    idx: usize,
    sectorno: u32,
    guard: Option<SleepGuard<'a, [u8; BLOCK_SZ]>>,
}

impl<'a> Buf<'a> {
    pub fn sectorno(&self) -> u32 {
        self.sectorno
    }

    /// 同步写穿到磁盘。
    pub fn write(&mut self) {
        self.cache
            .dev
            .write_block(self.sectorno as usize, self.guard.as_ref().unwrap().as_slice());
    }
}

impl<'a> Deref for Buf<'a> {
    type Target = [u8; BLOCK_SZ];

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().unwrap()
    }
}

impl<'a> DerefMut for Buf<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().unwrap()
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        // 先放睡眠锁再动链表
        self.guard.take();
        let mut inner = self.cache.inner.lock();
        inner.meta[self.idx].refcnt -= 1;
        if inner.meta[self.idx].refcnt == 0 {
            inner.detach(self.idx);
            inner.attach_front(self.idx);
        }
    }
}
