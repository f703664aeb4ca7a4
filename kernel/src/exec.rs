//! exec：把 ELF 映像装进一张新的用户页表，
//! 成功后把内核页表的用户镜像换成新映像。
//!
//! 进程内核页表不更换（内核栈在里面），只替换其用户区间的映射，
//! 因此装载失败时旧映像毫发无损。

use alloc::vec;
use alloc::vec::Vec;
use kernel_console::println;
use kernel_vm::page_table::{Sv39, VmFlags};
use kernel_vm::{
    copy_out, page_round_up, uvm_clear, uvm_free, PageManager, PageTable, MAXUVA, PAGE_SIZE,
    TRAMPOLINE, TRAPFRAME,
};
use xmas_elf::header::{Machine, Type as ElfType};
use xmas_elf::program::Type as ProgramType;
use xmas_elf::ElfFile;

use crate::file;
use crate::kvm::Frames;
use crate::proc;

const MAXARG: usize = 32;
const USER_STACK_PAGES: usize = 2;

fn flags(s: &str) -> VmFlags<Sv39> {
    VmFlags::build_from_str(s)
}

/// 只在用户页表一侧扩张 [oldsz, newsz)，提交时再镜像进内核页表。
/// 失败回滚到 oldsz。
fn upt_alloc(upt: PageTable<Sv39>, oldsz: usize, newsz: usize) -> Option<usize> {
    if newsz < oldsz {
        return Some(oldsz);
    }
    if newsz > MAXUVA {
        return None;
    }
    let mut m = Frames;
    let base = page_round_up(oldsz);
    let mut a = base;
    while a < newsz {
        let Some(ppn) = m.allocate() else {
            if a > base {
                upt.unmap_pages(&mut m, base, (a - base) / PAGE_SIZE, true);
            }
            return None;
        };
        if upt
            .map_pages(&mut m, a, PAGE_SIZE, ppn.val() << 12, flags("VRWXU"))
            .is_err()
        {
            m.deallocate(ppn);
            if a > base {
                upt.unmap_pages(&mut m, base, (a - base) / PAGE_SIZE, true);
            }
            return None;
        }
        a += PAGE_SIZE;
    }
    Some(newsz)
}

/// 把段内容拷进新页表（新页表未装载，逐页解析物理地址）。
fn load_seg(upt: PageTable<Sv39>, va: usize, data: &[u8]) -> Result<(), ()> {
    let mut m = Frames;
    let mut copied = 0;
    while copied < data.len() {
        let page_va = va + copied;
        let pa = upt.walk_addr(&mut m, page_va).ok_or(())?;
        let in_page = PAGE_SIZE - page_va % PAGE_SIZE;
        let n = in_page.min(data.len() - copied);
        unsafe {
            core::ptr::copy_nonoverlapping(data[copied..].as_ptr(), pa as *mut u8, n);
        }
        copied += n;
    }
    Ok(())
}

/// 把 upt 的 [0, sz) 以去掉 U 的权限镜像进 kpt。
fn kpt_mirror(upt: PageTable<Sv39>, kpt: PageTable<Sv39>, sz: usize) -> Result<(), usize> {
    let mut m = Frames;
    let mut va = 0;
    while va < sz {
        let Some((pa, _)) = upt.translate(&mut m, va) else {
            return Err(va);
        };
        if kpt.map_pages(&mut m, va, PAGE_SIZE, pa, flags("VRWX")).is_err() {
            return Err(va);
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

/// 失败路径：拆掉装了一半的新用户页表。
fn discard_upt(upt: PageTable<Sv39>, sz: usize) {
    let mut m = Frames;
    upt.unmap_pages(&mut m, TRAMPOLINE, 1, false);
    upt.unmap_pages(&mut m, TRAPFRAME, 1, false);
    uvm_free(&mut m, upt, sz);
}

pub fn exec(path: &[u8], argv: &[Vec<u8>]) -> isize {
    let fs = file::fs();
    let (_, p) = proc::myproc().expect("exec");
    let owned = unsafe { p.owned() };

    // 读入整个映像
    let data = {
        let cwd = owned.res.as_ref().unwrap().cwd.as_ref().map(|c| fs.edup(c));
        let ep = fs.ename(cwd.as_ref(), path);
        if let Some(c) = cwd {
            fs.eput(c);
        }
        let Some(ep) = ep else { return -1 };
        let mut ef = fs.elock(&ep);
        let size = ef.file_size as usize;
        let mut data = vec![0u8; size];
        let got = fs.eread(&mut ef, 0, &mut data);
        drop(ef);
        fs.eput(ep);
        if got != size {
            return -1;
        }
        data
    };

    let Ok(elf) = ElfFile::new(&data) else {
        return -1;
    };
    if elf.header.pt2.type_().as_type() != ElfType::Executable {
        return -1;
    }
    if elf.header.pt2.machine().as_machine() != Machine::RISC_V {
        return -1;
    }
    let entry = elf.header.pt2.entry_point() as usize;

    let res = owned.res.as_mut().unwrap();
    let Some(new_upt) = proc::proc_pagetable(res.trapframe) else {
        return -1;
    };

    // 装载各段
    let mut sz = 0usize;
    for ph in elf.program_iter() {
        if ph.get_type() != Ok(ProgramType::Load) {
            continue;
        }
        let va = ph.virtual_addr() as usize;
        let memsz = ph.mem_size() as usize;
        let filesz = ph.file_size() as usize;
        let off = ph.offset() as usize;
        if memsz == 0 {
            continue;
        }
        if va % PAGE_SIZE != 0 || va < sz || filesz > memsz || off + filesz > data.len() {
            discard_upt(new_upt, sz);
            return -1;
        }
        let Some(new_sz) = upt_alloc(new_upt, sz, va + memsz) else {
            discard_upt(new_upt, sz);
            return -1;
        };
        sz = new_sz;
        if load_seg(new_upt, va, &data[off..off + filesz]).is_err() {
            discard_upt(new_upt, sz);
            return -1;
        }
    }

    // 用户栈：最低一页作守护页
    let stack_base = page_round_up(sz);
    let Some(new_sz) = upt_alloc(new_upt, stack_base, stack_base + USER_STACK_PAGES * PAGE_SIZE)
    else {
        discard_upt(new_upt, sz);
        return -1;
    };
    sz = new_sz;
    uvm_clear(&mut Frames, new_upt, stack_base);
    let stack_low = stack_base + PAGE_SIZE;
    let mut sp = sz;

    // argv 串与指针数组压栈
    let mut m = Frames;
    let argc = argv.len().min(MAXARG);
    let mut ustack = [0usize; MAXARG + 1];
    for (i, arg) in argv.iter().take(argc).enumerate() {
        sp -= arg.len() + 1;
        sp &= !15;
        if sp < stack_low {
            discard_upt(new_upt, sz);
            return -1;
        }
        let mut bytes = arg.clone();
        bytes.push(0);
        if copy_out(&mut m, new_upt, sp, &bytes).is_err() {
            discard_upt(new_upt, sz);
            return -1;
        }
        ustack[i] = sp;
    }
    ustack[argc] = 0;
    sp -= (argc + 1) * 8;
    sp &= !15;
    if sp < stack_low {
        discard_upt(new_upt, sz);
        return -1;
    }
    let mut ptr_bytes = Vec::with_capacity((argc + 1) * 8);
    for word in &ustack[..=argc] {
        ptr_bytes.extend_from_slice(&word.to_ne_bytes());
    }
    if copy_out(&mut m, new_upt, sp, &ptr_bytes).is_err() {
        discard_upt(new_upt, sz);
        return -1;
    }
    let argv_ptr = sp;

    // 提交：替换内核页表的用户镜像，再替换用户页表
    let old_sz = owned.sz;
    let old_pages = page_round_up(old_sz) / PAGE_SIZE;
    if old_pages > 0 {
        res.kpt.unmap_pages(&mut m, 0, old_pages, false);
    }
    if let Err(done) = kpt_mirror(new_upt, res.kpt, sz) {
        // 撤销半个新镜像，恢复旧镜像；旧映像原样保留
        if done > 0 {
            res.kpt.unmap_pages(&mut m, 0, done / PAGE_SIZE, false);
        }
        let old_upt = res.upt;
        if kpt_mirror(old_upt, res.kpt, page_round_up(old_sz)).is_err() {
            panic!("exec: cannot restore kernel mirror");
        }
        discard_upt(new_upt, sz);
        return -1;
    }
    unsafe { core::arch::asm!("sfence.vma zero, zero") };

    let old_upt = core::mem::replace(&mut res.upt, new_upt);
    owned.sz = sz;

    let tf = proc::current_trapframe();
    unsafe {
        (*tf).epc = entry;
        (*tf).sp = sp;
        (*tf).a1 = argv_ptr;
    }

    // 进程名取路径末级
    let last = path
        .rsplit(|&b| b == b'/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(path);
    owned.set_name(last);

    discard_upt(old_upt, old_sz);

    if argv.len() > MAXARG {
        println!("exec: too many args truncated");
    }
    argc as isize
}
