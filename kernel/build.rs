use std::{env, fs, path::PathBuf};

fn main() {
    // 将链接脚本写入 OUT_DIR 并传给链接器
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let linker_script_path = out_dir.join("linker.ld");
    fs::write(&linker_script_path, linker::SCRIPT).expect("Failed to write linker.ld");
    println!("cargo:rustc-link-arg=-T{}", linker_script_path.display());

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LOG");
}
