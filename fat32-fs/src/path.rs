//! 路径解析
//!
//! '/' 开头从根出发，否则从调用方给的当前目录出发；
//! 逐段取名、逐级 dirlookup，引用随走随还。

use crate::entry::Ent;
use crate::fs::FatFs;
use crate::layout::{Attr, FAT32_MAX_FILENAME};

/// 取下一段路径分量进 `name`，返回剩余路径。
/// 路径耗尽返回 None；分量超长截断到 FAT32_MAX_FILENAME。
fn skipelem<'a>(
    path: &'a [u8],
    name: &mut [u8; FAT32_MAX_FILENAME + 1],
) -> Option<(&'a [u8], usize)> {
    let mut i = 0;
    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    if i == path.len() {
        return None;
    }
    let start = i;
    while i < path.len() && path[i] != b'/' {
        i += 1;
    }
    let len = (i - start).min(FAT32_MAX_FILENAME);
    name[..len].copy_from_slice(&path[start..start + len]);
    name[len] = 0;
    let mut rest = i;
    while rest < path.len() && path[rest] == b'/' {
        rest += 1;
    }
    Some((&path[rest..], len))
}

impl FatFs {
    fn lookup_path(
        &self,
        cwd: Option<&Ent>,
        path: &[u8],
        parent: bool,
        name: &mut [u8; FAT32_MAX_FILENAME + 1],
    ) -> Option<Ent> {
        let mut entry = if path.first() == Some(&b'/') {
            self.root()
        } else if !path.is_empty() {
            match cwd {
                Some(cwd) => self.edup(cwd),
                None => self.root(),
            }
        } else {
            return None;
        };

        let mut rest = path;
        while let Some((next_rest, len)) = skipelem(rest, name) {
            rest = next_rest;
            let mut ef = self.elock(&entry);
            if !ef.attribute.contains(Attr::DIRECTORY) {
                drop(ef);
                self.eput(entry);
                return None;
            }
            if parent && rest.is_empty() {
                return Some(entry);
            }
            // dirlookup 会改写 ef 的扫描位置，分量名拷出避免借用纠缠
            let mut elem = [0u8; FAT32_MAX_FILENAME + 1];
            elem[..len].copy_from_slice(&name[..len]);
            let next = self.dirlookup(&entry, &mut ef, &elem[..len], None);
            drop(ef);
            match next {
                Some(next) => {
                    self.eput(entry);
                    entry = next;
                }
                None => {
                    self.eput(entry);
                    return None;
                }
            }
        }
        if parent {
            self.eput(entry);
            return None;
        }
        Some(entry)
    }

    /// 解析路径，返回末级目录项。
    pub fn ename(&self, cwd: Option<&Ent>, path: &[u8]) -> Option<Ent> {
        let mut name = [0u8; FAT32_MAX_FILENAME + 1];
        self.lookup_path(cwd, path, false, &mut name)
    }

    /// 解析路径，返回末级的父目录项；`name` 输出末级名字。
    pub fn ename_parent(
        &self,
        cwd: Option<&Ent>,
        path: &[u8],
        name: &mut [u8; FAT32_MAX_FILENAME + 1],
    ) -> Option<Ent> {
        self.lookup_path(cwd, path, true, name)
    }
}
