//! linker crate 功能性验证测试
//!
//! 这些测试验证链接脚本内容与布局类型；符号定位需要真实链接，
//! 在内核镜像里生效。

use linker::{KernelLayout, KernelRegionTitle, SCRIPT};

#[test]
fn test_script_contains_sections() {
    let script = core::str::from_utf8(SCRIPT).unwrap();
    assert!(script.contains("OUTPUT_ARCH(riscv)"));
    assert!(script.contains(".text.entry"));
    assert!(script.contains(".text.trampoline"));
    for sym in [
        "__start", "__rodata", "__data", "__sbss", "__ebss", "__boot", "__end", "trampoline",
    ] {
        assert!(script.contains(sym), "missing symbol {sym}");
    }
}

#[test]
fn test_script_base_address() {
    // OpenSBI 把内核放到 0x80200000
    let script = core::str::from_utf8(SCRIPT).unwrap();
    assert!(script.contains("0x80200000"));
}

#[test]
fn test_layout_init_and_regions() {
    let layout = KernelLayout::INIT;
    assert_eq!(layout.start(), usize::MAX);
    assert_eq!(layout.end(), usize::MAX);
    assert_eq!(layout.len(), 0);
    assert!(layout.is_empty());

    let titles: Vec<_> = layout.iter().map(|r| r.title).collect();
    assert_eq!(
        titles,
        vec![
            KernelRegionTitle::Text,
            KernelRegionTitle::Rodata,
            KernelRegionTitle::Data,
            KernelRegionTitle::Boot,
        ]
    );
}

#[test]
fn test_region_display() {
    let layout = KernelLayout::INIT;
    let first = layout.iter().next().unwrap();
    let text = format!("{first}");
    assert!(text.starts_with(".text:"));
}
